//! Failure notification by e-mail.
//!
//! [`SmtpNotifier`] speaks SMTP to a relay (EHLO, optional AUTH PLAIN,
//! MAIL, RCPT, DATA, QUIT). The connection is upgraded with STARTTLS, wrapped
//! in TLS from the first byte, or left plain, per [`EmailTlsMode`]. The whole
//! exchange is bounded by `timeout_secs`. Settings come from `mail.toml`,
//! which is only read when notification is enabled.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, info};

use crate::error::{ConfigError, NotifyError, Result};

/// Default name of the mail settings file.
pub const DEFAULT_MAIL_CONFIG_FILE: &str = "mail.toml";

/// Subject of the failure report, after the configured prefix.
pub const FAILURE_SUBJECT: &str = "Indexer Checker ERROR";

const HELO_NAME: &str = "localhost";

/// Transport security for the relay connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTlsMode {
    /// Plain SMTP; only for relays on a trusted network
    None,
    /// Upgrade with STARTTLS after the first EHLO
    #[default]
    StartTls,
    /// TLS from the first byte (SMTPS)
    Tls,
}

/// Mail relay settings.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmailNotifyConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub tls: EmailTlsMode,
    /// Extra PEM trust anchors for a relay with a private CA
    pub ca_file: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    pub subject_prefix: String,
    /// Upper bound for the whole SMTP exchange
    pub timeout_secs: u64,
}

impl Default for EmailNotifyConfig {
    fn default() -> Self {
        Self {
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            tls: EmailTlsMode::default(),
            ca_file: None,
            username: None,
            password: None,
            from: String::new(),
            to: Vec::new(),
            subject_prefix: "[PASS]".to_string(),
            timeout_secs: 30,
        }
    }
}

impl fmt::Debug for EmailNotifyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailNotifyConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("tls", &self.tls)
            .field("ca_file", &self.ca_file)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("from", &self.from)
            .field("to", &self.to)
            .field("subject_prefix", &self.subject_prefix)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl EmailNotifyConfig {
    /// Check the settings are usable for delivery.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.smtp_host.trim().is_empty() {
            return Err("smtp_host must not be empty".to_string());
        }
        if self.smtp_port == 0 {
            return Err("smtp_port must be non-zero".to_string());
        }
        if !is_valid_address(&self.from) {
            return Err(format!("from is not a valid address: {:?}", self.from));
        }
        if self.to.is_empty() {
            return Err("to must list at least one recipient".to_string());
        }
        if let Some(bad) = self.to.iter().find(|addr| !is_valid_address(addr)) {
            return Err(format!("to contains an invalid address: {bad:?}"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err("username and password must be set together".to_string());
        }
        if self.username.is_some() && self.tls == EmailTlsMode::None {
            return Err("username and password require tls = \"start_tls\" or \"tls\"".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }

    /// Load and validate `path`. The file is required.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), host = %config.smtp_host, "Loaded mail settings");
        Ok(config)
    }
}

fn is_valid_address(addr: &str) -> bool {
    if addr.chars().any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>') {
        return false;
    }
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

/// Future returned by [`Notifier::notify`].
pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), NotifyError>> + Send + 'a>>;

/// Delivers a failure report somewhere a human will see it.
pub trait Notifier: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &'static str;

    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> NotifyFuture<'a>;
}

/// SMTP notifier.
#[derive(Debug, Clone)]
pub struct SmtpNotifier {
    config: EmailNotifyConfig,
}

impl SmtpNotifier {
    #[must_use]
    pub fn new(config: EmailNotifyConfig) -> Self {
        Self { config }
    }

    /// Full subject line for `subject`, including the configured prefix.
    #[must_use]
    pub fn subject_line(&self, subject: &str) -> String {
        let prefix = self.config.subject_prefix.trim();
        if prefix.is_empty() {
            subject.to_string()
        } else {
            format!("{prefix} {subject}")
        }
    }

    async fn send(&self, subject: &str, body: &str) -> std::result::Result<(), NotifyError> {
        let secs = self.config.timeout_secs;
        tokio::time::timeout(Duration::from_secs(secs), self.deliver(subject, body))
            .await
            .map_err(|_| NotifyError::Timeout(secs))?
    }

    async fn deliver(&self, subject: &str, body: &str) -> std::result::Result<(), NotifyError> {
        let host = self.config.smtp_host.as_str();
        let port = self.config.smtp_port;
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| NotifyError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        match self.config.tls {
            EmailTlsMode::None => {
                let mut session = Session::new(stream);
                session.expect("greeting", 2).await?;
                self.transact(session, subject, body).await
            }
            EmailTlsMode::Tls => {
                let mut session = Session::new(self.handshake(stream).await?);
                session.expect("greeting", 2).await?;
                self.transact(session, subject, body).await
            }
            EmailTlsMode::StartTls => {
                let mut plain = Session::new(stream);
                plain.expect("greeting", 2).await?;
                let features = plain
                    .command(&format!("EHLO {HELO_NAME}"), "EHLO", 2)
                    .await?;
                if !offers_extension(&features, "STARTTLS") {
                    return Err(NotifyError::Tls(format!("{host} does not offer STARTTLS")));
                }
                plain.command("STARTTLS", "STARTTLS", 2).await?;
                let session = Session::new(self.handshake(plain.into_inner()).await?);
                self.transact(session, subject, body).await
            }
        }
    }

    /// EHLO through QUIT on an established, greeted connection.
    async fn transact<S>(
        &self,
        mut session: Session<S>,
        subject: &str,
        body: &str,
    ) -> std::result::Result<(), NotifyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        session.command(&format!("EHLO {HELO_NAME}"), "EHLO", 2).await?;

        if let (Some(user), Some(password)) = (&self.config.username, &self.config.password) {
            let token = BASE64.encode(format!("\0{user}\0{password}"));
            session
                .command(&format!("AUTH PLAIN {token}"), "AUTH PLAIN", 2)
                .await?;
        }

        session
            .command(&format!("MAIL FROM:<{}>", self.config.from), "MAIL FROM", 2)
            .await?;
        for rcpt in &self.config.to {
            session
                .command(&format!("RCPT TO:<{rcpt}>"), "RCPT TO", 2)
                .await?;
        }
        session.command("DATA", "DATA", 3).await?;

        let message = self.render_message(subject, body);
        session.send_raw(message.as_bytes()).await?;
        session.send_raw(b".\r\n").await?;
        session.expect("message body", 2).await?;

        // The message is accepted at this point; a failed QUIT changes nothing.
        if let Err(e) = session.command("QUIT", "QUIT", 2).await {
            debug!(error = %e, "SMTP QUIT failed after delivery");
        }
        Ok(())
    }

    async fn handshake(&self, stream: TcpStream) -> std::result::Result<TlsStream<TcpStream>, NotifyError> {
        let host = self.config.smtp_host.as_str();
        let name = ServerName::try_from(host)
            .map_err(|e| NotifyError::Tls(format!("invalid server name {host:?}: {e}")))?
            .to_owned();
        let connector = TlsConnector::from(Arc::new(self.tls_config()?));
        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| NotifyError::Tls(format!("handshake with {host} failed: {e}")))?;
        debug!(host, "SMTP connection secured");
        Ok(stream)
    }

    fn tls_config(&self) -> std::result::Result<ClientConfig, NotifyError> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = &self.config.ca_file {
            let pem = std::fs::read(path)
                .map_err(|e| NotifyError::Tls(format!("cannot read {}: {e}", path.display())))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert
                    .map_err(|e| NotifyError::Tls(format!("bad PEM in {}: {e}", path.display())))?;
                roots
                    .add(cert)
                    .map_err(|e| NotifyError::Tls(format!("bad CA in {}: {e}", path.display())))?;
            }
        }
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NotifyError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(config)
    }

    fn render_message(&self, subject: &str, body: &str) -> String {
        let mut message = String::new();
        message.push_str(&format!("From: {}\r\n", self.config.from));
        message.push_str(&format!("To: {}\r\n", self.config.to.join(", ")));
        message.push_str(&format!("Subject: {}\r\n", header_safe(&self.subject_line(subject))));
        message.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        message.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        for line in body.lines() {
            if line.starts_with('.') {
                message.push('.');
            }
            message.push_str(line);
            message.push_str("\r\n");
        }
        message
    }
}

impl Notifier for SmtpNotifier {
    fn name(&self) -> &'static str {
        "smtp"
    }

    fn notify<'a>(&'a self, subject: &'a str, body: &'a str) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.send(subject, body).await?;
            info!(
                host = %self.config.smtp_host,
                recipients = self.config.to.len(),
                "Failure notification sent"
            );
            Ok(())
        })
    }
}

fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Whether an EHLO reply (lines joined by `" | "`) lists `keyword`.
fn offers_extension(ehlo_reply: &str, keyword: &str) -> bool {
    ehlo_reply.split(" | ").any(|line| {
        line.get(4..)
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(keyword))
    })
}

struct Session<S> {
    stream: BufReader<S>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> std::result::Result<(), NotifyError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send `line` and require a reply in the `class`xx range. `label` names the
    /// command in errors so credentials never reach a log.
    async fn command(
        &mut self,
        line: &str,
        label: &str,
        class: u16,
    ) -> std::result::Result<String, NotifyError> {
        self.send_raw(format!("{line}\r\n").as_bytes()).await?;
        self.expect(label, class).await
    }

    async fn expect(&mut self, label: &str, class: u16) -> std::result::Result<String, NotifyError> {
        let (code, reply) = self.read_reply().await?;
        if code / 100 != class {
            return Err(NotifyError::Rejected {
                command: label.to_string(),
                reply,
            });
        }
        Ok(reply)
    }

    /// Read a possibly multi-line reply, returning its code and the joined text.
    async fn read_reply(&mut self) -> std::result::Result<(u16, String), NotifyError> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            let line = line.trim_end().to_string();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| NotifyError::Rejected {
                    command: "reply".to_string(),
                    reply: line.clone(),
                })?;
            let more = line.as_bytes().get(3) == Some(&b'-');
            text.push(line);
            if !more {
                return Ok((code, text.join(" | ")));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;

    fn valid() -> EmailNotifyConfig {
        EmailNotifyConfig {
            smtp_host: "relay.example.org".to_string(),
            from: "checker@example.org".to_string(),
            to: vec!["ops@example.org".to_string()],
            ..EmailNotifyConfig::default()
        }
    }

    const CA_FILE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/tls/ca.pem");
    const RELAY_CERT: &str = include_str!("../tests/fixtures/tls/relay.pem");
    const RELAY_KEY: &str = include_str!("../tests/fixtures/tls/relay.key");

    #[derive(Clone, Copy, Default)]
    struct Relay {
        reject_rcpt: bool,
        no_starttls: bool,
    }

    enum Ended<S> {
        Closed,
        StartTls(S),
    }

    fn acceptor() -> TlsAcceptor {
        let certs = rustls_pemfile::certs(&mut RELAY_CERT.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        let key = rustls_pemfile::private_key(&mut RELAY_KEY.as_bytes())
            .unwrap()
            .unwrap();
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    /// Answer commands on `stream`, recording each line received.
    async fn converse<S>(stream: S, relay: Relay, greet: bool, received: &mut Vec<String>) -> Ended<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        if greet {
            stream.write_all(b"220 fake ESMTP\r\n").await.unwrap();
            stream.flush().await.unwrap();
        }
        let mut in_data = false;
        loop {
            let mut line = String::new();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return Ended::Closed,
                Ok(_) => {}
            }
            let line = line.trim_end_matches("\r\n").to_string();
            received.push(line.clone());
            let reply: &[u8] = if in_data {
                if line != "." {
                    continue;
                }
                in_data = false;
                b"250 queued\r\n"
            } else if line.starts_with("EHLO") {
                if relay.no_starttls {
                    b"250-fake\r\n250 AUTH PLAIN\r\n"
                } else {
                    b"250-fake\r\n250-STARTTLS\r\n250 AUTH PLAIN\r\n"
                }
            } else if line == "STARTTLS" {
                stream.write_all(b"220 ready\r\n").await.unwrap();
                stream.flush().await.unwrap();
                return Ended::StartTls(stream.into_inner());
            } else if line.starts_with("AUTH") {
                b"235 ok\r\n"
            } else if line.starts_with("RCPT") && relay.reject_rcpt {
                b"550 no such user\r\n"
            } else if line == "DATA" {
                in_data = true;
                b"354 go ahead\r\n"
            } else if line == "QUIT" {
                stream.write_all(b"221 bye\r\n").await.unwrap();
                stream.flush().await.unwrap();
                return Ended::Closed;
            } else {
                b"250 ok\r\n"
            };
            stream.write_all(reply).await.unwrap();
            stream.flush().await.unwrap();
        }
    }

    /// Relay on a local port speaking SMTP per `mode`. The join handle yields
    /// every line received; `<tls>` marks a completed STARTTLS upgrade.
    async fn fake_relay(mode: EmailTlsMode, relay: Relay) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            if mode == EmailTlsMode::Tls {
                if let Ok(tls) = acceptor().accept(tcp).await {
                    converse(tls, relay, true, &mut received).await;
                }
            } else if let Ended::StartTls(tcp) = converse(tcp, relay, true, &mut received).await {
                if let Ok(tls) = acceptor().accept(tcp).await {
                    received.push("<tls>".to_string());
                    converse(tls, relay, false, &mut received).await;
                }
            }
            received
        });
        (port, handle)
    }

    fn local(port: u16, tls: EmailTlsMode) -> EmailNotifyConfig {
        EmailNotifyConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            tls,
            ca_file: Some(PathBuf::from(CA_FILE)),
            ..valid()
        }
    }

    #[test]
    fn default_config_needs_addresses() {
        let err = EmailNotifyConfig::default().validate().unwrap_err();
        assert!(err.contains("from"), "{err}");
        assert_eq!(EmailNotifyConfig::default().smtp_port, 25);
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validation_rules() {
        let cases: Vec<(EmailNotifyConfig, &str)> = vec![
            (
                EmailNotifyConfig {
                    smtp_host: " ".to_string(),
                    ..valid()
                },
                "smtp_host",
            ),
            (
                EmailNotifyConfig {
                    smtp_port: 0,
                    ..valid()
                },
                "smtp_port",
            ),
            (
                EmailNotifyConfig {
                    from: "checker".to_string(),
                    ..valid()
                },
                "from",
            ),
            (EmailNotifyConfig { to: vec![], ..valid() }, "to"),
            (
                EmailNotifyConfig {
                    to: vec!["ops@localhost".to_string()],
                    ..valid()
                },
                "to",
            ),
            (
                EmailNotifyConfig {
                    username: Some("relay".to_string()),
                    ..valid()
                },
                "username",
            ),
            (
                EmailNotifyConfig {
                    tls: EmailTlsMode::None,
                    username: Some("relay".to_string()),
                    password: Some("secret".to_string()),
                    ..valid()
                },
                "tls",
            ),
            (
                EmailNotifyConfig {
                    timeout_secs: 0,
                    ..valid()
                },
                "timeout_secs",
            ),
        ];
        for (config, needle) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.contains(needle), "expected {needle:?} in {err:?}");
        }
    }

    #[test]
    fn addresses_with_line_breaks_are_rejected() {
        assert!(!is_valid_address("ops@example.org\r\nBcc: x@y.z"));
        assert!(!is_valid_address("a@b@example.org"));
        assert!(is_valid_address("first.last@mail.example.org"));
    }

    #[test]
    fn load_requires_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = EmailNotifyConfig::load(&dir.path().join("mail.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn load_parses_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.toml");
        std::fs::write(
            &path,
            "smtp_host = \"relay\"\nfrom = \"a@example.org\"\nto = [\"b@example.org\"]\n",
        )
        .unwrap();
        let config = EmailNotifyConfig::load(&path).unwrap();
        assert_eq!(config.smtp_host, "relay");
        assert_eq!(config.subject_prefix, "[PASS]");
        assert_eq!(config.tls, EmailTlsMode::StartTls);

        std::fs::write(
            &path,
            "smtp_host = \"relay\"\nsmtp_port = 465\ntls = \"tls\"\nfrom = \"a@example.org\"\nto = [\"b@example.org\"]\n",
        )
        .unwrap();
        assert_eq!(EmailNotifyConfig::load(&path).unwrap().tls, EmailTlsMode::Tls);

        std::fs::write(&path, "smtp_host = \"relay\"\n").unwrap();
        let err = EmailNotifyConfig::load(&path).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Config(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn debug_output_redacts_password() {
        let config = EmailNotifyConfig {
            username: Some("relay".to_string()),
            password: Some("hunter2".to_string()),
            ..valid()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn subject_line_uses_prefix() {
        let notifier = SmtpNotifier::new(valid());
        assert_eq!(
            notifier.subject_line(FAILURE_SUBJECT),
            "[PASS] Indexer Checker ERROR"
        );
        let bare = SmtpNotifier::new(EmailNotifyConfig {
            subject_prefix: String::new(),
            ..valid()
        });
        assert_eq!(bare.subject_line(FAILURE_SUBJECT), "Indexer Checker ERROR");
    }

    #[test]
    fn message_body_is_dot_stuffed() {
        let notifier = SmtpNotifier::new(valid());
        let message = notifier.render_message(FAILURE_SUBJECT, "first\n.hidden\nlast");
        assert!(message.contains("Subject: [PASS] Indexer Checker ERROR\r\n"));
        assert!(message.contains("\r\n\r\nfirst\r\n..hidden\r\nlast\r\n"));
    }

    #[test]
    fn starttls_keyword_is_found_in_ehlo_reply() {
        assert!(offers_extension("250-fake | 250-STARTTLS | 250 AUTH PLAIN", "STARTTLS"));
        assert!(offers_extension("250-fake | 250 starttls", "STARTTLS"));
        assert!(!offers_extension("250-fake | 250 AUTH PLAIN", "STARTTLS"));
    }

    #[tokio::test]
    async fn authenticates_only_after_starttls() {
        let (port, relay) = fake_relay(EmailTlsMode::StartTls, Relay::default()).await;
        let notifier = SmtpNotifier::new(EmailNotifyConfig {
            username: Some("relay".to_string()),
            password: Some("secret".to_string()),
            to: vec!["ops@example.org".to_string(), "dev@example.org".to_string()],
            ..local(port, EmailTlsMode::StartTls)
        });

        notifier
            .notify(FAILURE_SUBJECT, "Error: Check failed")
            .await
            .unwrap();
        let received = relay.await.unwrap();

        assert_eq!(received[..3], ["EHLO localhost", "STARTTLS", "<tls>"]);
        assert_eq!(received[3], "EHLO localhost");
        let token = BASE64.encode("\0relay\0secret");
        assert_eq!(received[4], format!("AUTH PLAIN {token}"));
        assert_eq!(received[5], "MAIL FROM:<checker@example.org>");
        assert_eq!(received[6], "RCPT TO:<ops@example.org>");
        assert_eq!(received[7], "RCPT TO:<dev@example.org>");
        assert_eq!(received[8], "DATA");
        assert!(received.iter().any(|l| l == "Subject: [PASS] Indexer Checker ERROR"));
        assert!(received.iter().any(|l| l == "Error: Check failed"));
        assert_eq!(received.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn delivers_over_implicit_tls() {
        let (port, relay) = fake_relay(EmailTlsMode::Tls, Relay::default()).await;
        let notifier = SmtpNotifier::new(local(port, EmailTlsMode::Tls));

        notifier.notify(FAILURE_SUBJECT, "body").await.unwrap();
        let received = relay.await.unwrap();

        assert_eq!(received[0], "EHLO localhost");
        assert!(!received.iter().any(|l| l == "STARTTLS"));
        assert_eq!(received.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn delivers_in_plain_text_when_tls_is_off() {
        let (port, relay) = fake_relay(EmailTlsMode::None, Relay::default()).await;
        let notifier = SmtpNotifier::new(local(port, EmailTlsMode::None));

        notifier.notify(FAILURE_SUBJECT, "body").await.unwrap();
        let received = relay.await.unwrap();

        assert_eq!(received[0], "EHLO localhost");
        assert_eq!(received[1], "MAIL FROM:<checker@example.org>");
        assert!(!received.iter().any(|l| l.starts_with("AUTH")));
    }

    #[tokio::test]
    async fn missing_starttls_stops_before_credentials() {
        let relay_behaviour = Relay {
            no_starttls: true,
            ..Relay::default()
        };
        let (port, relay) = fake_relay(EmailTlsMode::StartTls, relay_behaviour).await;
        let notifier = SmtpNotifier::new(EmailNotifyConfig {
            username: Some("relay".to_string()),
            password: Some("secret".to_string()),
            ..local(port, EmailTlsMode::StartTls)
        });

        let err = notifier.notify(FAILURE_SUBJECT, "body").await.unwrap_err();
        assert!(matches!(&err, NotifyError::Tls(msg) if msg.contains("STARTTLS")), "{err:?}");
        let received = relay.await.unwrap();
        assert_eq!(received, vec!["EHLO localhost".to_string()]);
    }

    #[tokio::test]
    async fn untrusted_relay_certificate_is_rejected() {
        let (port, _relay) = fake_relay(EmailTlsMode::Tls, Relay::default()).await;
        let notifier = SmtpNotifier::new(EmailNotifyConfig {
            ca_file: None,
            ..local(port, EmailTlsMode::Tls)
        });

        let err = notifier.notify(FAILURE_SUBJECT, "body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Tls(_)), "{err:?}");
    }

    #[tokio::test]
    async fn rejected_recipient_is_an_error() {
        let relay_behaviour = Relay {
            reject_rcpt: true,
            ..Relay::default()
        };
        let (port, _relay) = fake_relay(EmailTlsMode::None, relay_behaviour).await;
        let notifier = SmtpNotifier::new(local(port, EmailTlsMode::None));

        let err = notifier.notify(FAILURE_SUBJECT, "body").await.unwrap_err();
        match err {
            NotifyError::Rejected { command, reply } => {
                assert_eq!(command, "RCPT TO");
                assert!(reply.starts_with("550"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn silent_relay_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });
        let notifier = SmtpNotifier::new(EmailNotifyConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            timeout_secs: 1,
            ..valid()
        });

        let err = notifier.notify(FAILURE_SUBJECT, "body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Timeout(1)));
    }

    #[tokio::test]
    async fn refused_connection_reports_host() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let notifier = SmtpNotifier::new(EmailNotifyConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            ..valid()
        });

        let err = notifier.notify(FAILURE_SUBJECT, "body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Connect { port: p, .. } if p == port));
    }
}
