//! Control channel state machine
//!
//! One session per connection, strictly sequential:
//!
//! 1. Await an extended login carrying the test-selection bitmask.
//! 2. Refuse clients without the status capability, otherwise announce the
//!    queue position, server version and planned tests.
//! 3. Run the upload then the download sub-test, as requested.
//! 4. Report both rates and log out.
//!
//! A failing sub-test only zeroes its own rate. Failures before negotiation
//! completes end the session without telling the client.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::conn::Connection;
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::protocol::{MessageKind, SERVER_VERSION};
use crate::serve::ServerConfig;
use crate::subtest::{C2sTest, S2cTest, SubTest};

pub const TEST_C2S: i64 = 2;
pub const TEST_S2C: i64 = 4;
pub const TEST_STATUS: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestId {
    /// Client-to-server, upload
    C2s,
    /// Server-to-client, download
    S2c,
}

impl TestId {
    pub fn code(self) -> i64 {
        match self {
            TestId::C2s => TEST_C2S,
            TestId::S2c => TEST_S2C,
        }
    }

    /// Metrics label
    pub fn label(self) -> &'static str {
        match self {
            TestId::C2s => "c2s",
            TestId::S2c => "s2c",
        }
    }
}

impl std::fmt::Display for TestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestId::C2s => write!(f, "C2S"),
            TestId::S2c => write!(f, "S2C"),
        }
    }
}

/// Test-selection bitmask sent by the client at login
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestSelection(i64);

impl TestSelection {
    pub fn new(bits: i64) -> Self {
        Self(bits)
    }

    /// Parse the decimal `tests` field of an extended login
    pub fn parse(field: &str) -> Result<Self, SessionError> {
        field
            .parse::<i64>()
            .map(Self)
            .map_err(|source| SessionError::Parse {
                field: field.to_string(),
                source,
            })
    }

    pub fn bits(self) -> i64 {
        self.0
    }

    pub fn has_status(self) -> bool {
        self.0 & TEST_STATUS != 0
    }

    pub fn plan(self) -> TestPlan {
        let mut tests = Vec::new();
        if self.0 & TEST_C2S != 0 {
            tests.push(TestId::C2s);
        }
        if self.0 & TEST_S2C != 0 {
            tests.push(TestId::S2c);
        }
        TestPlan { tests }
    }
}

/// Sub-tests to run, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPlan {
    tests: Vec<TestId>,
}

impl TestPlan {
    pub fn tests(&self) -> &[TestId] {
        &self.tests
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Space-joined test codes, as announced in the second login message
    pub fn announcement(&self) -> String {
        self.tests
            .iter()
            .map(|t| t.code().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionResult {
    pub upload_kbps: f64,
    pub download_kbps: f64,
}

impl SessionResult {
    fn record(&mut self, test: TestId, rate_kbps: f64) {
        match test {
            TestId::C2s => self.upload_kbps = rate_kbps,
            TestId::S2c => self.download_kbps = rate_kbps,
        }
    }

    /// Human-readable results line sent to the client
    pub fn summary(&self) -> String {
        format!(
            "You uploaded at {:.4} and downloaded at {:.4}",
            self.upload_kbps, self.download_kbps
        )
    }
}

pub struct ControlChannel {
    config: Arc<ServerConfig>,
    upload: Arc<dyn SubTest>,
    download: Arc<dyn SubTest>,
    metrics: Arc<dyn Metrics>,
}

impl ControlChannel {
    /// Control channel backed by the built-in C2S and S2C tests
    pub fn new(config: Arc<ServerConfig>, metrics: Arc<dyn Metrics>) -> Self {
        Self::with_sub_tests(config, Arc::new(C2sTest), Arc::new(S2cTest), metrics)
    }

    pub fn with_sub_tests(
        config: Arc<ServerConfig>,
        upload: Arc<dyn SubTest>,
        download: Arc<dyn SubTest>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            config,
            upload,
            download,
            metrics,
        }
    }

    /// Run one session over `conn`. The caller owns closing it.
    pub async fn run(&self, conn: &mut dyn Connection) -> Result<SessionResult, SessionError> {
        let login = conn.receive_message(MessageKind::ExtendedLogin).await?;
        let selection = TestSelection::parse(login.tests.as_deref().unwrap_or_default())?;
        if !selection.has_status() {
            return Err(SessionError::Rejected {
                tests: selection.bits(),
            });
        }

        let plan = selection.plan();
        debug!(
            "Client {} requested tests={} plan=[{}]",
            login.msg,
            selection.bits(),
            plan.announcement()
        );
        conn.send_message(MessageKind::SrvQueue, "0").await?;
        conn.send_message(MessageKind::Login, SERVER_VERSION).await?;
        conn.send_message(MessageKind::Login, &plan.announcement())
            .await?;

        let mut result = SessionResult::default();
        for &test in plan.tests() {
            let sub_test = match test {
                TestId::C2s => &self.upload,
                TestId::S2c => &self.download,
            };
            match sub_test.run(conn, &self.config).await {
                Ok(rate) => {
                    result.record(test, rate);
                    self.metrics.observe(test.label(), rate / 1000.0);
                }
                Err(e) => warn!("{} test ({}) failed: {:#}", test, sub_test.name(), e),
            }
        }

        info!(
            "NDT: uploaded at {:.4} and downloaded at {:.4}",
            result.upload_kbps, result.download_kbps
        );
        conn.send_message(MessageKind::Results, &result.summary())
            .await?;
        conn.send_message(MessageKind::Logout, "").await?;
        Ok(result)
    }

    /// Run a session, log how it ended and close the connection
    pub async fn serve(&self, conn: &mut dyn Connection) -> Result<SessionResult, SessionError> {
        let peer = conn
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let transport = conn.transport();

        let outcome = self.run(conn).await;
        match &outcome {
            Ok(_) => debug!("Session with {} ({}) complete", peer, transport),
            Err(SessionError::Rejected { tests }) => {
                info!(
                    "Rejected {} ({}): no TestStatus support (tests={})",
                    peer, transport, tests
                )
            }
            Err(e) => warn!("Session with {} ({}) aborted: {}", peer, transport, e),
        }

        if let Err(e) = conn.close().await {
            debug!("Closing connection to {}: {}", peer, e);
        }
        outcome
    }
}
