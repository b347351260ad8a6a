//! Error types for pass-indexer-checker-core

use std::fmt::Write;
use thiserror::Error;

use crate::wait::PollError;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a diagnostic command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pass-indexer-checker-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Search index errors
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Resource repository errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// A check assertion did not hold
    #[error("Check failed: {0}")]
    Check(#[from] CheckError),

    /// A polled condition was never observed
    #[error(transparent)]
    Poll(#[from] PollError),

    /// The run was interrupted outside a poll
    #[error("Cancelled during {0}")]
    Cancelled(String),

    /// Notification delivery errors
    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a poll should treat this error as a transient miss.
    ///
    /// Only connectivity failures and server-side statuses qualify; assertion
    /// and configuration errors abort the poll on first sight.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Index(e) => e.is_retryable(),
            Self::Repository(e) => e.is_retryable(),
            Self::Io(_) => true,
            Self::Config(_)
            | Self::Check(_)
            | Self::Poll(_)
            | Self::Cancelled(_)
            | Self::Notify(_)
            | Self::Json(_) => false,
        }
    }

    /// True when the run stopped because it was asked to, not because a check failed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) | Self::Poll(PollError::Cancelled { .. }) => true,
            Self::Poll(PollError::Aborted { source, .. }) => source.is_cancelled(),
            _ => false,
        }
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(err.remediation()),
            Self::Index(err) => Some(err.remediation()),
            Self::Repository(err) => Some(err.remediation()),
            Self::Check(err) => Some(err.remediation()),
            Self::Poll(err) => Some(err.remediation()),
            Self::Cancelled(_) => Some(
                Remediation::new("The run was interrupted before it finished.")
                    .command("Rerun", "pass-indexer-checker"),
            ),
            Self::Notify(NotifyError::Tls(_)) => Some(
                Remediation::new("The relay's TLS setup does not match mail.toml.")
                    .command(
                        "Inspect relay",
                        "openssl s_client -starttls smtp -connect <smtp_host>:<smtp_port>",
                    )
                    .alternative("Set tls = \"tls\" for SMTPS ports, or ca_file for a private CA."),
            ),
            Self::Notify(_) => Some(
                Remediation::new("Mail delivery failed. Check the relay settings in mail.toml.")
                    .command("Check relay", "nc -vz <smtp_host> <smtp_port>")
                    .alternative("Run without --email to skip notification."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("List config files", "ls -l system.toml mail.toml"),
            ),
            Self::Json(_) => Some(
                Remediation::new("The index returned a body that is not valid JSON.")
                    .command("Inspect mapping", "curl -s \"$PASS_ELASTICSEARCH_URL/pass\"")
                    .alternative("Verify pass.elasticsearch.url points at Elasticsearch."),
            ),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Required config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid URL for {key}: {value:?} ({reason})")]
    InvalidUrl {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Create it or point to it explicitly."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --mail-config with the correct path, or drop --email."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("Show config", "cat system.toml")
                .alternative("Quote string values: pass.fedora.user = \"fedoraAdmin\""),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show config", "cat system.toml")
                    .alternative("Remove the field to fall back to its default.")
            }
            Self::InvalidUrl { key, .. } => Remediation::new(format!(
                "Set {key} to an absolute http(s) URL."
            ))
            .command("Show config", "cat system.toml")
            .alternative("Environment variables override the file, e.g. PASS_ELASTICSEARCH_URL."),
        }
    }
}

/// Search index errors
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response from {url}: {detail}")]
    MalformedResponse { url: String, detail: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl IndexError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::MalformedResponse { .. } | Self::Client(_) => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Request { url, .. } => {
                Remediation::new("Elasticsearch is unreachable. Check that it is running.")
                    .command("Probe", format!("curl -sv \"{url}\""))
                    .alternative("Verify pass.elasticsearch.url and network access.")
            }
            Self::Status { url, status } => Remediation::new(format!(
                "Elasticsearch answered {status}. Check the index exists and is healthy."
            ))
            .command("Probe", format!("curl -s \"{url}\""))
            .command("Cluster health", "curl -s \"$PASS_ELASTICSEARCH_URL/_cluster/health\""),
            Self::MalformedResponse { url, .. } => {
                Remediation::new("Elasticsearch returned an unexpected document shape.")
                    .command("Inspect", format!("curl -s \"{url}\""))
                    .alternative("Confirm the Elasticsearch version matches the PASS indexer.")
            }
            Self::Client(_) => Remediation::new("HTTP client setup failed.")
                .command("Check TLS roots", "ls /etc/ssl/certs")
                .alternative("Retry; this is usually an environment problem."),
        }
    }
}

/// Resource repository errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned HTTP {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },

    #[error("Invalid resource identifier: {0}")]
    InvalidId(String),

    #[error("Expected at most one {kind} with {attribute}={value}, found {count}")]
    AmbiguousMatch {
        kind: String,
        attribute: String,
        value: String,
        count: usize,
    },
}

impl RepositoryError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            Self::InvalidId(_) | Self::AmbiguousMatch { .. } => false,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Request { url, .. } => {
                Remediation::new("The repository is unreachable. Check that Fedora is running.")
                    .command("Probe", format!("curl -sv \"{url}\""))
                    .alternative("Verify pass.fedora.baseurl and network access.")
            }
            Self::Status { url, status, .. } => Remediation::new(format!(
                "The repository answered {status}. Check credentials and container paths."
            ))
            .command("Probe", format!("curl -s -u \"$PASS_FEDORA_USER\" \"{url}\""))
            .alternative("Verify pass.fedora.user and pass.fedora.password."),
            Self::InvalidId(id) => Remediation::new("The repository returned an unusable id.")
                .command("Inspect", format!("curl -sI \"{id}\"")),
            Self::AmbiguousMatch {
                attribute, value, ..
            } => Remediation::new(format!(
                "Several records share {attribute}={value}. Remove the duplicates."
            ))
            .command(
                "List matches",
                format!("curl -s \"$PASS_ELASTICSEARCH_URL/pass/_search?q={attribute}:{value}\""),
            ),
        }
    }
}

/// Assertion failures raised by the check sequence
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Index mapping has no {path} object")]
    MappingPathMissing { path: String },

    #[error("Index mapping has {found} properties; more than {minimum} required")]
    TooFewMappingProperties { found: usize, minimum: usize },

    #[error("Index holds {found} submitters; at least {minimum} required")]
    TooFewSubmitters { found: usize, minimum: usize },

    #[error("Stale sentinel {id} from an earlier run was found and removed")]
    StaleSentinel { id: String },

    #[error("Repository did not return an identifier for the new sentinel")]
    SentinelNotCreated,
}

impl CheckError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::MappingPathMissing { .. } | Self::TooFewMappingProperties { .. } => {
                Remediation::new("The index is not provisioned with the PASS mapping.")
                    .command("Inspect mapping", "curl -s \"$PASS_ELASTICSEARCH_URL/pass\"")
                    .alternative("Recreate the index from the PASS indexer configuration.")
            }
            Self::TooFewSubmitters { .. } => {
                Remediation::new("The index looks empty. Check the indexer has caught up.")
                    .command(
                        "Count submitters",
                        "curl -s \"$PASS_ELASTICSEARCH_URL/pass/_count?q=roles:submitter\"",
                    )
                    .alternative("Lower check.min_submitters on fresh deployments.")
            }
            Self::StaleSentinel { .. } => Remediation::new(
                "A previous run left its sentinel behind; it has been cleaned up. Run again.",
            )
            .command("Rerun", "pass-indexer-checker")
            .alternative("Set check.fail_on_stale_sentinel = false to continue after cleanup."),
            Self::SentinelNotCreated => {
                Remediation::new("Fedora accepted the create but returned no Location.")
                    .command("Probe", "curl -sI \"$PASS_FEDORA_BASEURL/users\"")
                    .alternative("Check the repository logs for the failed create.")
            }
        }
    }
}

/// Notification delivery errors
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("SMTP connection to {host}:{port} failed: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("SMTP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SMTP server rejected {command}: {reply}")]
    Rejected { command: String, reply: String },

    #[error("SMTP exchange timed out after {0} seconds")]
    Timeout(u64),

    #[error("SMTP TLS failure: {0}")]
    Tls(String),
}

/// Format an error with its cause chain and remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut shown = error.to_string();
    let mut output = format!("Error: {shown}");
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        // Wrapper variants already embed their inner error's message.
        let text = cause.to_string();
        if !shown.contains(&text) {
            let _ = write!(output, "\n  caused by: {text}");
        }
        shown = text;
        source = cause.source();
    }
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
