use health_records_shared::auth::{self, Credentials, IdentityProvider};
use health_records_shared::blobs::BlobStore;
use health_records_shared::error::ApiError;
use health_records_shared::http::{
    empty_response, error_response, json_response, method_not_allowed, not_found, parse_body,
    preflight,
};
use health_records_shared::profiles::{self, ProfileRequest};
use health_records_shared::scope::Requester;
use health_records_shared::store::Store;
use health_records_shared::tasks::TaskQueue;
use health_records_shared::{notifications, records, AppState};
use lambda_http::{
    http::{Method, StatusCode},
    Body, Error, Request, RequestExt, Response,
};
use serde::Serialize;
use std::sync::Arc;

/// What a matched route produced, rendered in one place.
enum Reply {
    Json(StatusCode, serde_json::Value),
    Empty(StatusCode),
    MethodNotAllowed,
}

fn json<T: Serialize>(status: StatusCode, value: T) -> Result<Reply, ApiError> {
    serde_json::to_value(value)
        .map(|value| Reply::Json(status, value))
        .map_err(|e| ApiError::Internal(format!("Failed to serialize response: {}", e)))
}

fn render(result: Result<Reply, ApiError>) -> Result<Response<Body>, Error> {
    match result {
        Ok(Reply::Json(status, value)) => json_response(status, &value),
        Ok(Reply::Empty(status)) => empty_response(status),
        Ok(Reply::MethodNotAllowed) => method_not_allowed(),
        Err(e) => error_response(&e),
    }
}

/// Paths served under `/api`, with `{id}` segments as wildcards.
fn is_known_route(parts: &[&str]) -> bool {
    matches!(
        parts,
        ["accounts", "login" | "register" | "me" | "profile-create" | "profile-update" | "doctors"]
            | ["records", "patient"]
            | ["records", "patient", _]
            | ["records", "files", _]
            | ["records", "doctor"]
            | ["records", "doctor", _]
            | ["records", "doctor", "annotations", _]
            | ["notifications"]
            | ["notifications", _]
    )
}

fn credentials(event: &Request) -> Credentials<'_> {
    let header = |name: &str| event.headers().get(name).and_then(|v| v.to_str().ok());
    Credentials {
        verified_subject: event
            .request_context_ref()
            .and_then(|context| context.authorizer())
            .and_then(|auth| auth.jwt.as_ref())
            .and_then(|jwt| jwt.claims.get("sub"))
            .map(String::as_str),
        bearer_token: header("Authorization").and_then(|value| value.strip_prefix("Bearer ")),
        user_id_header: header("X-User-Id"),
    }
}

/// Main Lambda handler - routes `/api/...` requests to the service layer
pub(crate) async fn function_handler<S, I, B, Q>(
    event: Request,
    state: Arc<AppState<S, I, B, Q>>,
) -> Result<Response<Body>, Error>
where
    S: Store,
    I: IdentityProvider,
    B: BlobStore,
    Q: TaskQueue,
{
    let method = event.method();
    let path = event.uri().path();
    tracing::info!("API request - Method: {} Path: {}", method, path);

    // Handle CORS preflight
    if method == Method::OPTIONS {
        return preflight();
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let route = match parts.as_slice() {
        ["api", rest @ ..] if is_known_route(rest) => rest,
        _ => {
            tracing::warn!("No route matched - Method: {} Path: {}", method, path);
            return not_found();
        }
    };
    let body: &[u8] = event.body();

    // Account routes that do not need an identity
    match (method, route) {
        (&Method::POST, ["accounts", "login"]) => {
            return render(async {
                let request = parse_body(body)?;
                json(StatusCode::OK, auth::login(&state.store, &state.identity, request).await?)
            }
            .await);
        }
        (&Method::POST, ["accounts", "register"]) => {
            return render(async {
                let request = parse_body(body)?;
                json(
                    StatusCode::CREATED,
                    auth::register(&state.store, &state.identity, request).await?,
                )
            }
            .await);
        }
        (_, ["accounts", "login" | "register"]) => return method_not_allowed(),
        _ => {}
    }

    let requester = match auth::resolve_requester(
        &state.store,
        &state.identity,
        credentials(&event),
        state.config.allow_user_id_header,
    )
    .await
    {
        Ok(requester) => requester,
        Err(e) => return error_response(&e),
    };
    tracing::info!("Request by user {} ({})", requester.id(), requester.role().as_str());

    render(route_authenticated(method, route, body, &state, &requester).await)
}

async fn route_authenticated<S, I, B, Q>(
    method: &Method,
    route: &[&str],
    body: &[u8],
    state: &AppState<S, I, B, Q>,
    requester: &Requester,
) -> Result<Reply, ApiError>
where
    S: Store,
    I: IdentityProvider,
    B: BlobStore,
    Q: TaskQueue,
{
    let store = &state.store;

    match (method, route) {
        // --- ACCOUNTS ---
        (&Method::GET, ["accounts", "me"]) => {
            json(StatusCode::OK, profiles::current_user(store, requester).await?)
        }
        (&Method::POST, ["accounts", "profile-create"]) => {
            let request = ProfileRequest::parse(requester.role(), body)?;
            json(
                StatusCode::CREATED,
                profiles::create_profile(store, requester, request).await?,
            )
        }
        (&Method::PUT | &Method::PATCH, ["accounts", "profile-update"]) => {
            let request = ProfileRequest::parse(requester.role(), body)?;
            json(
                StatusCode::OK,
                profiles::update_profile(store, requester, request).await?,
            )
        }
        (&Method::GET, ["accounts", "doctors"]) => {
            json(StatusCode::OK, profiles::list_doctors(store, requester).await?)
        }

        // --- PATIENT RECORDS ---
        (&Method::GET, ["records", "patient"]) => {
            json(StatusCode::OK, records::list_patient_records(store, requester).await?)
        }
        (&Method::POST, ["records", "patient"]) => {
            let request = parse_body(body)?;
            let view =
                records::create_record(store, &state.blobs, &state.queue, requester, request)
                    .await?;
            json(StatusCode::CREATED, view)
        }
        (&Method::GET, ["records", "patient", record_id]) => json(
            StatusCode::OK,
            records::retrieve_patient_record(store, requester, record_id).await?,
        ),
        (&Method::PUT | &Method::PATCH, ["records", "patient", record_id]) => {
            let request = parse_body(body)?;
            let view =
                records::update_patient_record(store, &state.blobs, requester, record_id, request)
                    .await?;
            json(StatusCode::OK, view)
        }
        (&Method::DELETE, ["records", "patient", record_id]) => {
            records::delete_patient_record(store, &state.blobs, requester, record_id).await?;
            Ok(Reply::Empty(StatusCode::NO_CONTENT))
        }
        (&Method::DELETE, ["records", "files", file_id]) => {
            records::delete_patient_file(store, &state.blobs, requester, file_id).await?;
            Ok(Reply::Empty(StatusCode::NO_CONTENT))
        }

        // --- DOCTOR RECORDS ---
        (&Method::GET, ["records", "doctor"]) => {
            json(StatusCode::OK, records::list_doctor_records(store, requester).await?)
        }
        (&Method::POST, ["records", "doctor", "annotations"]) => {
            let request = parse_body(body)?;
            let annotation =
                records::create_annotation(store, &state.queue, requester, request).await?;
            json(StatusCode::CREATED, annotation)
        }
        (_, ["records", "doctor", "annotations"]) => Ok(Reply::MethodNotAllowed),
        (&Method::GET, ["records", "doctor", record_id]) => json(
            StatusCode::OK,
            records::retrieve_doctor_record(store, requester, record_id).await?,
        ),
        (&Method::PUT | &Method::PATCH, ["records", "doctor", "annotations", annotation_id]) => {
            let request = parse_body(body)?;
            let annotation =
                records::update_annotation(store, requester, annotation_id, request).await?;
            json(StatusCode::OK, annotation)
        }

        // --- NOTIFICATIONS ---
        (&Method::GET, ["notifications"]) => json(
            StatusCode::OK,
            notifications::list_notifications(store, requester).await?,
        ),
        (&Method::POST, ["notifications", "mark-all-read"]) => {
            json(StatusCode::OK, notifications::mark_all_read(store, requester).await?)
        }
        (&Method::DELETE, ["notifications", "delete-all"]) => {
            notifications::delete_all(store, requester).await?;
            Ok(Reply::Empty(StatusCode::NO_CONTENT))
        }
        (_, ["notifications", "mark-all-read" | "delete-all"]) => Ok(Reply::MethodNotAllowed),
        (&Method::GET, ["notifications", notification_id]) => json(
            StatusCode::OK,
            notifications::retrieve_notification(store, requester, notification_id).await?,
        ),

        _ => Ok(Reply::MethodNotAllowed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use health_records_shared::config::AppConfig;
    use health_records_shared::email::MemoryMailer;
    use health_records_shared::tasks::{RetryPolicy, TaskOutcome};
    use health_records_shared::MemoryState;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn state() -> Arc<MemoryState> {
        MemoryState::in_memory(AppConfig {
            allow_user_id_header: true,
            email_retry: RetryPolicy {
                max_retries: 3,
                countdown: Duration::ZERO,
            },
            ..Default::default()
        })
    }

    fn request(method: &str, path: &str, token: Option<&str>, body: Option<Value>) -> Request {
        let mut builder = lambda_http::http::Request::builder()
            .method(method)
            .uri(path)
            .header("Content-Type", "application/json");
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::Empty,
        };
        builder.body(body).unwrap()
    }

    async fn call(
        state: &Arc<MemoryState>,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let response = function_handler(request(method, path, token, body), Arc::clone(state))
            .await
            .unwrap();
        let status = response.status();
        let bytes: &[u8] = response.body();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(bytes).unwrap()
        };
        (status, value)
    }

    struct Account {
        id: String,
        token: String,
    }

    async fn register(state: &Arc<MemoryState>, email: &str, first: &str, last: &str, role: &str) -> Account {
        let (status, body) = call(
            state,
            "POST",
            "/api/accounts/register/",
            None,
            Some(json!({
                "email": email,
                "password": "s3cure-pass",
                "first_name": first,
                "last_name": last,
                "role": role,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        Account {
            id: body["id"].as_str().unwrap().to_string(),
            token: body["tokens"]["access"].as_str().unwrap().to_string(),
        }
    }

    /// A registered user who has also completed a profile.
    async fn onboard(state: &Arc<MemoryState>, email: &str, first: &str, last: &str, role: &str) -> Account {
        let account = register(state, email, first, last, role).await;
        let profile = match role {
            "doctor" => json!({"specialization": "General practice", "license_number": format!("MD-{}", email)}),
            _ => json!({"gender": "female"}),
        };
        let (status, body) = call(
            state,
            "POST",
            "/api/accounts/profile-create/",
            Some(&account.token),
            Some(profile),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        account
    }

    fn one_file(name: &str) -> Value {
        json!([{
            "file_name": name,
            "content_type": "application/pdf",
            "file_data": base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.4"),
        }])
    }

    async fn create_record(state: &Arc<MemoryState>, patient: &Account, doctor: &Account) -> Value {
        let (status, body) = call(
            state,
            "POST",
            "/api/records/patient/",
            Some(&patient.token),
            Some(json!({
                "doctor": doctor.id,
                "record_type": "lab_result",
                "description": "Blood panel",
                "files": one_file("panel.pdf"),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body
    }

    #[tokio::test]
    async fn test_preflight_and_unknown_routes() {
        let state = state();
        let (status, _) = call(&state, "OPTIONS", "/api/records/patient/", None, None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&state, "GET", "/api/nothing-here/", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, "GET", "/api/accounts/login/", None, None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_requests_without_identity_are_rejected() {
        let state = state();
        let (status, body) = call(&state, "GET", "/api/records/patient/", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "NotAuthenticated");

        let (status, _) = call(&state, "GET", "/api/notifications/", Some("forged"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_user_id_header_when_allowed() {
        let state = state();
        let patient = register(&state, "pat@test.com", "Pat", "Smith", "patient").await;
        let mut event = request("GET", "/api/accounts/me/", None, None);
        event
            .headers_mut()
            .insert("X-User-Id", patient.id.parse().unwrap());
        let response = function_handler(event, Arc::clone(&state)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_returns_user_and_tokens() {
        let state = state();
        register(&state, "pat@test.com", "Pat", "Smith", "patient").await;

        let (status, body) = call(
            &state,
            "POST",
            "/api/accounts/login/",
            None,
            Some(json!({"email": "pat@test.com", "password": "s3cure-pass"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["role"], "patient");
        assert!(body["tokens"]["access"].is_string());

        let (status, _) = call(
            &state,
            "POST",
            "/api/accounts/login/",
            None,
            Some(json!({"email": "pat@test.com", "password": "nope-nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_bad_request() {
        let state = state();
        register(&state, "pat@test.com", "Pat", "Smith", "patient").await;
        let (status, body) = call(
            &state,
            "POST",
            "/api/accounts/register/",
            None,
            Some(json!({
                "email": "pat@test.com",
                "password": "another-pass",
                "first_name": "Pat",
                "last_name": "Again",
                "role": "patient",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Conflict");
    }

    #[tokio::test]
    async fn test_profile_create_once_then_update() {
        let state = state();
        let doctor = register(&state, "doc@test.com", "Greg", "House", "doctor").await;
        let profile = json!({"specialization": "Diagnostics", "license_number": "MD-1"});

        let (status, _) = call(
            &state,
            "PATCH",
            "/api/accounts/profile-update/",
            Some(&doctor.token),
            Some(json!({"years_of_experience": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &state,
            "POST",
            "/api/accounts/profile-create/",
            Some(&doctor.token),
            Some(profile.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["years_of_experience"], 0);

        let (status, _) = call(
            &state,
            "POST",
            "/api/accounts/profile-create/",
            Some(&doctor.token),
            Some(profile),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &state,
            "PATCH",
            "/api/accounts/profile-update/",
            Some(&doctor.token),
            Some(json!({"years_of_experience": 20})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["years_of_experience"], 20);
        assert_eq!(body["specialization"], "Diagnostics");

        let (_, me) = call(&state, "GET", "/api/accounts/me/", Some(&doctor.token), None).await;
        assert_eq!(me["profile"]["license_number"], "MD-1");
    }

    #[tokio::test]
    async fn test_doctor_directory_is_patient_only() {
        let state = state();
        let patient = register(&state, "pat@test.com", "Pat", "Smith", "patient").await;
        let doctor = register(&state, "doc@test.com", "Greg", "House", "doctor").await;
        call(
            &state,
            "POST",
            "/api/accounts/profile-create/",
            Some(&doctor.token),
            Some(json!({"specialization": "Diagnostics", "license_number": "MD-1"})),
        )
        .await;

        let (status, body) =
            call(&state, "GET", "/api/accounts/doctors/", Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], doctor.id.as_str());

        let (status, _) =
            call(&state, "GET", "/api/accounts/doctors/", Some(&doctor.token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_record_visible_only_to_assigned_doctor() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "Patient", "patient").await;
        let doctor_b = onboard(&state, "b@test.com", "Bob", "Doctor", "doctor").await;
        let doctor_c = onboard(&state, "c@test.com", "Carol", "Doctor", "doctor").await;

        let record = create_record(&state, &patient, &doctor_b).await;
        let path = format!("/api/records/doctor/{}/", record["id"].as_str().unwrap());

        let (status, _) = call(&state, "GET", &path, Some(&doctor_c.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&state, "GET", &path, Some(&doctor_b.token), None).await;
        assert_eq!(status, StatusCode::OK);
        let files = body["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["file_name"], "panel.pdf");
        assert_eq!(body["patient"]["id"], patient.id.as_str());
    }

    #[tokio::test]
    async fn test_lists_are_scoped_per_role() {
        let state = state();
        let alice = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let dave = onboard(&state, "d@test.com", "Dave", "D", "patient").await;
        let bob = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        let carol = onboard(&state, "c@test.com", "Carol", "C", "doctor").await;

        create_record(&state, &alice, &bob).await;
        create_record(&state, &alice, &carol).await;
        create_record(&state, &dave, &bob).await;

        let count = |body: Value| body.as_array().map(Vec::len).unwrap_or(0);
        let (_, body) = call(&state, "GET", "/api/records/patient/", Some(&alice.token), None).await;
        assert_eq!(count(body), 2);
        let (_, body) = call(&state, "GET", "/api/records/patient/", Some(&dave.token), None).await;
        assert_eq!(count(body), 1);
        let (_, body) = call(&state, "GET", "/api/records/doctor/", Some(&bob.token), None).await;
        assert_eq!(count(body), 2);
        let (_, body) = call(&state, "GET", "/api/records/doctor/", Some(&carol.token), None).await;
        assert_eq!(count(body), 1);

        let (status, _) = call(&state, "GET", "/api/records/doctor/", Some(&alice.token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_annotating_unassigned_record_is_bad_request() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor_b = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        let doctor_c = onboard(&state, "c@test.com", "Carol", "C", "doctor").await;
        let record = create_record(&state, &patient, &doctor_c).await;

        let (status, body) = call(
            &state,
            "POST",
            "/api/records/doctor/annotations/",
            Some(&doctor_b.token),
            Some(json!({"record": record["id"], "note": "Not my patient"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
    }

    #[tokio::test]
    async fn test_mark_all_read_keeps_earlier_read_at() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        let record = create_record(&state, &patient, &doctor).await;

        for note in ["First look", "Second look", "Third look"] {
            let (status, _) = call(
                &state,
                "POST",
                "/api/records/doctor/annotations/",
                Some(&doctor.token),
                Some(json!({"record": record["id"], "note": note})),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (_, listed) = call(&state, "GET", "/api/notifications/", Some(&patient.token), None).await;
        let listed = listed.as_array().unwrap().clone();
        assert_eq!(listed.len(), 3);
        assert!(listed.iter().all(|n| n["notification_type"] == "record_annotated"));

        let read_path = format!("/api/notifications/{}/", listed[2]["id"].as_str().unwrap());
        let (status, read) = call(&state, "GET", &read_path, Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::OK);
        let first_read_at = read["read_at"].clone();
        assert!(first_read_at.is_string());

        let (status, body) = call(
            &state,
            "POST",
            "/api/notifications/mark-all-read/",
            Some(&patient.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updated"], 2);

        let (_, after) = call(&state, "GET", "/api/notifications/", Some(&patient.token), None).await;
        let after = after.as_array().unwrap();
        assert!(after.iter().all(|n| n["is_read"] == true));
        let kept = after
            .iter()
            .find(|n| n["id"] == listed[2]["id"])
            .unwrap();
        assert_eq!(kept["read_at"], first_read_at);
    }

    #[tokio::test]
    async fn test_notification_routes_are_recipient_scoped() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        create_record(&state, &patient, &doctor).await;

        let (_, listed) = call(&state, "GET", "/api/notifications/", Some(&doctor.token), None).await;
        let id = listed[0]["id"].as_str().unwrap().to_string();
        assert_eq!(listed[0]["notification_type"], "patient_assigned");
        assert_eq!(
            listed[0]["message"],
            "New health record created by patient Alice A"
        );

        let path = format!("/api/notifications/{}/", id);
        let (status, _) = call(&state, "GET", &path, Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) =
            call(&state, "GET", "/api/notifications/delete-all/", Some(&doctor.token), None).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _) = call(
            &state,
            "DELETE",
            "/api/notifications/delete-all/",
            Some(&doctor.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, listed) = call(&state, "GET", "/api/notifications/", Some(&doctor.token), None).await;
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_delete_cascades_over_http() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        let record = create_record(&state, &patient, &doctor).await;
        let path = format!("/api/records/patient/{}/", record["id"].as_str().unwrap());

        let (status, _) = call(&state, "DELETE", &path, Some(&doctor.token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&state, "DELETE", &path, Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.record_count(), 0);
        assert_eq!(state.store.file_count(), 0);
        assert_eq!(state.store.notification_count(), 0);
        assert_eq!(state.blobs.object_count(), 0);

        let (status, _) = call(&state, "GET", &path, Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_file_delete_route() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let other = onboard(&state, "z@test.com", "Zed", "Z", "patient").await;
        let doctor = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        let record = create_record(&state, &patient, &doctor).await;
        let path = format!("/api/records/files/{}/", record["files"][0]["id"].as_str().unwrap());

        let (status, _) = call(&state, "DELETE", &path, Some(&other.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&state, "DELETE", &path, Some(&patient.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.file_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_body_is_bad_request() {
        let state = state();
        let patient = register(&state, "a@test.com", "Alice", "A", "patient").await;
        let response = function_handler(
            {
                let mut event = request("POST", "/api/records/patient/", Some(&patient.token), None);
                *event.body_mut() = Body::from("{not json");
                event
            },
            Arc::clone(&state),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queued_email_reaches_doctor() {
        let state = state();
        let patient = onboard(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor = onboard(&state, "b@test.com", "Bob", "B", "doctor").await;
        create_record(&state, &patient, &doctor).await;

        let mailer = MemoryMailer::new();
        mailer.fail_next(1);
        let tasks = state.queue.drain();
        assert_eq!(tasks.len(), 1);
        let outcome =
            notifications::run_task(&state.store, &mailer, state.config.email_retry, &tasks[0])
                .await;
        assert_eq!(outcome, TaskOutcome::Completed { attempts: 2 });
        assert_eq!(mailer.sent()[0].to, "b@test.com");
    }
    #[tokio::test]
    async fn test_records_need_completed_profiles() {
        let state = state();
        let patient = register(&state, "a@test.com", "Alice", "A", "patient").await;
        let doctor = register(&state, "b@test.com", "Bob", "B", "doctor").await;
        let body = json!({
            "doctor": doctor.id,
            "record_type": "lab_result",
            "description": "Blood panel",
        });

        let (status, _) = call(&state, "POST", "/api/records/patient/", Some(&patient.token), Some(body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &state,
            "POST",
            "/api/accounts/profile-create/",
            Some(&patient.token),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&state, "POST", "/api/records/patient/", Some(&patient.token), Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.store.record_count(), 0);
    }
}
