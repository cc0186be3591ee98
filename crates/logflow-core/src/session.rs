//! Session establishment: connect, wait for liveness, log in.

use crate::broker::BrokerClient;
use crate::config::SessionConfig;
use crate::events::{EngineEvent, Observer, SessionStage};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// An established broker session.
pub struct Session {
    client: Arc<dyn BrokerClient>,
    authenticated: bool,
}

impl Session {
    /// Connect, wait until the broker answers pings, then log in when
    /// credentials are configured. Failures are logged through `tracing`.
    pub async fn open(client: Arc<dyn BrokerClient>, config: &SessionConfig) -> Result<Self> {
        Self::open_observed(client, config, &Observer::tracing()).await
    }

    /// Like [`Session::open`], reporting a failed step to `observer` as one
    /// `SessionFailed` event.
    pub async fn open_observed(
        client: Arc<dyn BrokerClient>,
        config: &SessionConfig,
        observer: &Observer,
    ) -> Result<Self> {
        let failed = |stage: SessionStage, error: Error| {
            observer.emit(EngineEvent::SessionFailed {
                stage,
                kind: error.kind(),
                message: error.to_string(),
            });
            error
        };

        client
            .connect()
            .await
            .map_err(|e| failed(SessionStage::Connect, e))?;
        debug!("Transport connected");

        wait_for_ping(client.as_ref(), config.ping_timeout(), config.ping_interval())
            .await
            .map_err(|e| failed(SessionStage::Ping, e))?;

        let authenticated = match config.credentials() {
            Some(credentials) => {
                client
                    .login(&credentials)
                    .await
                    .map_err(|e| failed(SessionStage::Login, e))?;
                info!(username = %credentials.username, "Logged in");
                true
            }
            None => {
                debug!("No credentials configured, skipping login");
                false
            }
        };

        Ok(Self {
            client,
            authenticated,
        })
    }

    /// The connected client.
    pub fn client(&self) -> Arc<dyn BrokerClient> {
        self.client.clone()
    }

    /// Whether the session logged in.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Disconnect.
    pub async fn close(self) -> Result<()> {
        self.client.disconnect().await?;
        info!("Session closed");
        Ok(())
    }
}

/// Ping until the broker answers or `timeout` elapses.
async fn wait_for_ping(
    client: &dyn BrokerClient,
    timeout: Duration,
    interval: Duration,
) -> Result<()> {
    let mut last_error = None;
    let attempts = async {
        loop {
            match client.ping().await {
                Ok(()) => return,
                Err(e) => {
                    debug!(error = %e, "Ping failed, retrying");
                    last_error = Some(e.to_string());
                }
            }
            tokio::time::sleep(interval).await;
        }
    };

    if tokio::time::timeout(timeout, attempts).await.is_err() {
        let reason = last_error.unwrap_or_else(|| "no answer".into());
        return Err(Error::Connection(format!(
            "broker did not answer ping within {:?}: {}",
            timeout, reason
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Credentials, Fault, InMemoryBroker, Operation};
    use crate::events::MemorySink;
    use crate::ErrorKind;

    fn recording() -> (Observer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Observer::new().with_sink(sink.clone()), sink)
    }

    fn session_failures(sink: &MemorySink) -> Vec<(SessionStage, ErrorKind)> {
        sink.failures()
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::SessionFailed { stage, kind, .. } => Some((stage, kind)),
                _ => None,
            })
            .collect()
    }

    fn config(credentials: Option<(&str, &str)>) -> SessionConfig {
        SessionConfig {
            username: credentials.map(|c| c.0.to_string()),
            password: credentials.map(|c| c.1.to_string()),
            ping_timeout_ms: 1_000,
            ping_interval_ms: 100,
        }
    }

    #[tokio::test]
    async fn test_open_and_login() {
        let broker = Arc::new(InMemoryBroker::with_credentials(Credentials::new(
            "iggy", "iggy",
        )));

        let session = Session::open(broker.clone(), &config(Some(("iggy", "iggy"))))
            .await
            .unwrap();
        assert!(session.is_authenticated());
        assert_eq!(broker.calls(Operation::Login), 1);

        session.close().await.unwrap();
        assert_eq!(broker.calls(Operation::Disconnect), 1);
    }

    #[tokio::test]
    async fn test_wrong_credentials_is_auth_error() {
        let broker = Arc::new(InMemoryBroker::with_credentials(Credentials::new(
            "iggy", "iggy",
        )));

        let err = Session::open(broker, &config(Some(("iggy", "wrong"))))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_connect_failure_fails_fast() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject_fault(Operation::Connect, Fault::Connection("refused".into()));

        let err = Session::open(broker.clone(), &config(None))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(broker.calls(Operation::Ping), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_retried_until_answered() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject_fault(Operation::Ping, Fault::Connection("starting".into()));
        broker.inject_fault(Operation::Ping, Fault::Connection("starting".into()));

        let session = Session::open(broker.clone(), &config(None)).await.unwrap();
        assert!(!session.is_authenticated());
        assert_eq!(broker.calls(Operation::Ping), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_is_connection_error() {
        let broker = Arc::new(InMemoryBroker::new());
        for _ in 0..20 {
            broker.inject_fault(Operation::Ping, Fault::Connection("down".into()));
        }

        let err = Session::open(broker, &config(None)).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().contains("did not answer ping"));
    }

    #[tokio::test]
    async fn test_connect_failure_reported_once() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.inject_fault(Operation::Connect, Fault::Connection("refused".into()));
        let (observer, sink) = recording();

        Session::open_observed(broker, &config(None), &observer)
            .await
            .err()
            .unwrap();
        assert_eq!(sink.failures().len(), 1);
        assert_eq!(
            session_failures(&sink),
            vec![(SessionStage::Connect, ErrorKind::Connection)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_reported_once() {
        let broker = Arc::new(InMemoryBroker::new());
        for _ in 0..20 {
            broker.inject_fault(Operation::Ping, Fault::Connection("down".into()));
        }
        let (observer, sink) = recording();

        Session::open_observed(broker, &config(None), &observer)
            .await
            .err()
            .unwrap();
        assert_eq!(sink.failures().len(), 1);
        assert_eq!(
            session_failures(&sink),
            vec![(SessionStage::Ping, ErrorKind::Connection)]
        );
    }

    #[tokio::test]
    async fn test_rejected_login_reported_once() {
        let broker = Arc::new(InMemoryBroker::with_credentials(Credentials::new(
            "iggy", "iggy",
        )));
        let (observer, sink) = recording();

        Session::open_observed(broker, &config(Some(("iggy", "wrong"))), &observer)
            .await
            .err()
            .unwrap();
        assert_eq!(sink.failures().len(), 1);
        assert_eq!(
            session_failures(&sink),
            vec![(SessionStage::Login, ErrorKind::Auth)]
        );
    }

    #[tokio::test]
    async fn test_successful_open_reports_nothing() {
        let broker = Arc::new(InMemoryBroker::new());
        let (observer, sink) = recording();

        Session::open_observed(broker, &config(None), &observer)
            .await
            .unwrap();
        assert!(sink.events().is_empty());
    }
}
