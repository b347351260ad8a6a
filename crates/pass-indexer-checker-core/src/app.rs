//! Application wiring: configuration in, check run and failure report out.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::check::{CheckReport, CheckSettings, Checker};
use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::error::{Error, Result, format_error_with_remediation};
use crate::index::IndexClient;
use crate::notify::{DEFAULT_MAIL_CONFIG_FILE, EmailNotifyConfig, FAILURE_SUBJECT, Notifier, SmtpNotifier};
use crate::repository::PassRepository;
use crate::wait::CancelToken;

/// Startup options chosen on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppOptions {
    /// Send a failure report by e-mail
    pub email: bool,
    pub config_path: PathBuf,
    pub mail_config_path: PathBuf,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            email: false,
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            mail_config_path: PathBuf::from(DEFAULT_MAIL_CONFIG_FILE),
        }
    }
}

/// A configured checker ready to run.
pub struct App {
    config: Config,
    notifier: Option<Box<dyn Notifier>>,
}

impl App {
    /// Load settings and, when e-mail is enabled, the required mail settings.
    pub fn load(options: &AppOptions) -> Result<Self> {
        let config = Config::load(&options.config_path)?;
        let notifier = if options.email {
            let mail = EmailNotifyConfig::load(&options.mail_config_path)?;
            info!(host = %mail.smtp_host, recipients = mail.to.len(), "Failure e-mail enabled");
            Some(Box::new(SmtpNotifier::new(mail)) as Box<dyn Notifier>)
        } else {
            None
        };
        Ok(Self { config, notifier })
    }

    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            notifier: None,
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the production checker from the loaded configuration.
    pub fn checker(&self, cancel: CancelToken) -> Result<Checker<IndexClient, PassRepository>> {
        let pass = &self.config.pass;
        let index = IndexClient::new(&pass.elasticsearch, &pass.http)?;
        let repository = PassRepository::new(&pass.fedora, &pass.http, index.clone())?;
        Ok(Checker::new(
            index,
            repository,
            CheckSettings::from(&self.config.check),
            cancel,
        ))
    }

    /// Run the checks. Failures other than cancellation are reported through
    /// the notifier, if any, before being returned.
    pub async fn run(&self, cancel: &CancelToken) -> Result<CheckReport> {
        let outcome = match self.checker(cancel.clone()) {
            Ok(checker) => checker.run().await,
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(report) => info!(
                mapping_properties = report.mapping_properties,
                submitters = report.submitters,
                poll_sleeps = report.round_trip.sleeps(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "All index checks passed"
            ),
            Err(e) if e.is_cancelled() => warn!(error = %e, "Check run cancelled"),
            Err(e) => {
                error!(error = %e, "Index check failed");
                if let Some(notifier) = &self.notifier {
                    report_failure(notifier.as_ref(), e).await;
                }
            }
        }
        outcome
    }
}

/// Send `error` through `notifier`. Delivery problems are logged, never returned.
pub async fn report_failure(notifier: &dyn Notifier, error: &Error) {
    let body = format_error_with_remediation(error);
    if let Err(e) = notifier.notify(FAILURE_SUBJECT, &body).await {
        warn!(notifier = notifier.name(), error = %e, "Failed to send failure notification");
    }
}
