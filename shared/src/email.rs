use std::future::Future;
use std::sync::Mutex;

use aws_sdk_sesv2::types::{Body, Content, Destination, EmailContent, Message};
use aws_sdk_sesv2::Client as SesClient;

use crate::types::{Notification, User};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

#[derive(Debug, thiserror::Error)]
#[error("email delivery failed: {0}")]
pub struct MailError(pub String);

pub trait Mailer: Send + Sync {
    fn send(&self, email: &OutgoingEmail) -> impl Future<Output = Result<(), MailError>> + Send;
}

/// Build the email for a notification. The message is read from the stored
/// notification at send time.
pub fn compose_notification_email(recipient: &User, notification: &Notification) -> OutgoingEmail {
    let subject = format!(
        "Health Record Notification - {}",
        notification.notification_type.display()
    );

    let html_body = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{
            font-family: 'HelveticaNeue', Helvetica, Arial, sans-serif;
            line-height: 1.6;
            color: #333333;
            margin: 0;
            padding: 0;
        }}
        .wrapper {{
            max-width: 600px;
            margin: 0 auto;
            padding: 40px 20px;
        }}
        .container {{
            border: 1px solid #e5e5e5;
            padding: 40px;
        }}
        .title {{
            font-size: 20px;
            font-weight: 300;
            color: #000000;
            margin: 0 0 24px 0;
        }}
        .text {{
            font-size: 15px;
            margin: 0 0 24px 0;
        }}
        .footer {{
            margin-top: 32px;
            padding-top: 16px;
            border-top: 1px solid #e5e5e5;
            font-size: 13px;
            color: #666666;
        }}
    </style>
</head>
<body>
    <div class="wrapper">
        <div class="container">
            <h2 class="title">{}</h2>
            <p class="text">Hello {},</p>
            <p class="text">{}</p>
            <div class="footer">Sign in to view the health record.</div>
        </div>
    </div>
</body>
</html>"#,
        notification.notification_type.display(),
        html_escape(&recipient.first_name),
        html_escape(&notification.message)
    );

    OutgoingEmail {
        to: recipient.email.clone(),
        subject,
        text_body: notification.message.clone(),
        html_body,
    }
}

fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub struct SesMailer {
    client: SesClient,
    from_email: String,
}

impl SesMailer {
    pub fn new(client: SesClient, from_email: impl Into<String>) -> Self {
        Self {
            client,
            from_email: from_email.into(),
        }
    }
}

impl Mailer for SesMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        let destination = Destination::builder().to_addresses(&email.to).build();

        let subject = Content::builder()
            .data(&email.subject)
            .charset("UTF-8")
            .build()
            .map_err(|e| MailError(format!("Failed to build subject: {:?}", e)))?;

        let html_content = Content::builder()
            .data(&email.html_body)
            .charset("UTF-8")
            .build()
            .map_err(|e| MailError(format!("Failed to build HTML content: {:?}", e)))?;

        let text_content = Content::builder()
            .data(&email.text_body)
            .charset("UTF-8")
            .build()
            .map_err(|e| MailError(format!("Failed to build text content: {:?}", e)))?;

        let body = Body::builder().html(html_content).text(text_content).build();
        let message = Message::builder().subject(subject).body(body).build();
        let content = EmailContent::builder().simple(message).build();

        self.client
            .send_email()
            .from_email_address(&self.from_email)
            .destination(destination)
            .content(content)
            .send()
            .await
            .map_err(|e| MailError(format!("Failed to send email: {:?}", e)))?;

        tracing::info!("Sent \"{}\" to {}", email.subject, email.to);
        Ok(())
    }
}

/// Mailer that keeps sent mail in memory and can be told to fail.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<OutgoingEmail>>,
    failures_left: Mutex<u32>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` sends.
    pub fn fail_next(&self, count: u32) {
        *self.failures_left.lock().unwrap_or_else(|p| p.into_inner()) = count;
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Mailer for MemoryMailer {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), MailError> {
        {
            let mut failures = self.failures_left.lock().unwrap_or_else(|p| p.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(MailError("mail transport unavailable".to_string()));
            }
        }
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(email.clone());
        Ok(())
    }
}
