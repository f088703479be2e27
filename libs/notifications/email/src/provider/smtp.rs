//! SMTP mail submission using lettre
//!
//! Every [`SmtpMailer::send`] opens its own SMTP session (the transport is built
//! without connection pooling), authenticates with PLAIN, submits one message to
//! one recipient and quits.

use super::Mailer;
use crate::error::MtaError;
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::message::Mailbox;
use lettre::transport::smtp::Error as SmtpError;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::debug;

/// How the SMTP session is secured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TlsMode {
    /// STARTTLS when the server offers it, plaintext otherwise
    #[default]
    Opportunistic,
    /// STARTTLS, failing if the server does not offer it
    Required,
    /// Implicit TLS from the first byte (port 465)
    Wrapper,
    /// Plaintext only (local relays, Mailpit)
    None,
}

/// SMTP provider configuration
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sender mailbox, either `addr` or `Name <addr>`
    pub from: String,
    pub tls: TlsMode,
    /// Bound on one whole SMTP session
    pub timeout: Duration,
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("from", &self.from)
            .field("tls", &self.tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SMTP mailer
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build a mailer. Fails with [`MtaError::Configuration`] if the sender or TLS
    /// settings are unusable.
    pub fn new(config: SmtpConfig) -> Result<Self, MtaError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| MtaError::Configuration(format!("invalid sender address {:?}: {e}", config.from)))?;

        let tls = match config.tls {
            TlsMode::None => Tls::None,
            mode => {
                let params = TlsParameters::new(config.host.clone())
                    .map_err(|e| MtaError::Configuration(format!("TLS setup for {}: {e}", config.host)))?;
                match mode {
                    TlsMode::Required => Tls::Required(params),
                    TlsMode::Wrapper => Tls::Wrapper(params),
                    _ => Tls::Opportunistic(params),
                }
            }
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .tls(tls)
            .credentials(Credentials::new(config.username.clone(), config.password.clone()))
            .authentication(vec![Mechanism::Plain])
            .timeout(Some(config.timeout))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), MtaError> {
        let to: Address = recipient
            .parse()
            .map_err(|e| MtaError::Permanent(format!("malformed recipient {recipient:?}: {e}")))?;

        let envelope = Envelope::new(Some(self.from.email.clone()), vec![to])
            .map_err(|e| MtaError::Permanent(format!("invalid envelope: {e}")))?;
        let raw = compose_message(&self.from.to_string(), recipient, subject, body);

        self.transport
            .send_raw(&envelope, raw.as_bytes())
            .await
            .map_err(|e| classify(&e))?;

        debug!(to = %recipient, "Message accepted by MTA");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

/// Render the raw RFC 5322 message: headers, a blank line, then the body verbatim.
///
/// CR and LF in the subject are folded into spaces so it cannot open new headers.
pub fn compose_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    let subject: String = subject
        .chars()
        .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
        .collect();

    format!(
        "From: {from}\r\n\
         To: {to}\r\n\
         Subject: {subject}\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: text/html; charset=\"UTF-8\"\r\n\
         \r\n\
         {body}"
    )
}

fn classify(err: &SmtpError) -> MtaError {
    let detail = err.to_string();
    if err.is_permanent() {
        MtaError::Permanent(detail)
    } else if err.is_client() && detail.contains("authentication mechanism") {
        MtaError::Configuration(detail)
    } else {
        // 4xx replies, timeouts, TLS and connection failures
        MtaError::Transient(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".into(),
            port: 1,
            username: "noreply@shop.test".into(),
            password: "secret".into(),
            from: "noreply@shop.test".into(),
            tls: TlsMode::None,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_compose_message_headers_then_body() {
        let raw = compose_message("noreply@shop.test", "a@x.io", "Hi", "<b>hi</b>");
        assert_eq!(
            raw,
            "From: noreply@shop.test\r\nTo: a@x.io\r\nSubject: Hi\r\nMIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=\"UTF-8\"\r\n\r\n<b>hi</b>"
        );
    }

    #[test]
    fn test_compose_message_folds_newlines_in_subject() {
        let raw = compose_message("f@x.io", "a@x.io", "Hi\r\nBcc: evil@x.io", "body");
        assert!(raw.contains("Subject: Hi  Bcc: evil@x.io\r\n"));
        assert!(!raw.contains("\r\nBcc:"));
    }

    #[test]
    fn test_compose_message_keeps_body_verbatim() {
        let body = "line one\r\n\r\nline two\n";
        assert!(compose_message("f@x.io", "a@x.io", "", body).ends_with("\r\n\r\nline one\r\n\r\nline two\n"));
    }

    #[test]
    fn test_tls_mode_parsing() {
        assert_eq!("opportunistic".parse::<TlsMode>().unwrap(), TlsMode::Opportunistic);
        assert_eq!("REQUIRED".parse::<TlsMode>().unwrap(), TlsMode::Required);
        assert_eq!("wrapper".parse::<TlsMode>().unwrap(), TlsMode::Wrapper);
        assert_eq!("none".parse::<TlsMode>().unwrap(), TlsMode::None);
        assert!("starttls-please".parse::<TlsMode>().is_err());
        assert_eq!(TlsMode::default().to_string(), "opportunistic");
    }

    #[test]
    fn test_invalid_sender_is_configuration_error() {
        let result = SmtpMailer::new(SmtpConfig {
            from: "not an address".into(),
            ..config()
        });
        assert!(matches!(result, Err(MtaError::Configuration(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("secret"));
    }

    #[tokio::test]
    async fn test_malformed_recipient_is_permanent_without_connecting() {
        let mailer = SmtpMailer::new(config()).unwrap();
        let result = mailer.send("not-an-address", "Hi", "body").await;
        assert!(matches!(result, Err(MtaError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let mailer = SmtpMailer::new(config()).unwrap();
        let result = mailer.send("a@x.io", "Hi", "body").await;
        assert!(matches!(result, Err(MtaError::Transient(_))), "{result:?}");
    }
}
