//! The per-interface reconciliation driver.

use super::address::apply_addresses;
use super::readiness::{wait_until_up, RetryPolicy};
use super::routes::apply_routes;
use super::{AppliedState, DesiredConfig, FirstError, LocalAddrs, RouterResult, Tools};
use crate::command::{argv, run_logged, CommandRunner};
use shared_utils::config::RouterConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether the router has applied any configuration yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterPhase {
    Idle,
    Configured,
}

/// Owns the applied state of one tun interface.
///
/// `reconcile` takes `&mut self`; callers sharing a router across tasks
/// must wrap it in a mutex.
pub struct Router {
    iface: String,
    tools: Tools,
    readiness: RetryPolicy,
    sysctls: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    state: AppliedState,
    phase: RouterPhase,
}

impl Router {
    pub fn new(iface: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            iface: iface.into(),
            tools: Tools::default(),
            readiness: RetryPolicy::default(),
            sysctls: Vec::new(),
            runner,
            state: AppliedState::default(),
            phase: RouterPhase::Idle,
        }
    }

    /// A router for the interface, tools, sysctls and readiness budget in `cfg`.
    pub fn from_config(cfg: &RouterConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(cfg.interface.clone(), runner)
            .with_tools(Tools {
                ifconfig: cfg.ifconfig.clone(),
                route: cfg.route.clone(),
                sysctl: cfg.sysctl.clone(),
            })
            .with_readiness(RetryPolicy::new(
                cfg.readiness.max_attempts,
                cfg.readiness.interval(),
            ))
            .with_sysctls(cfg.sysctls.clone())
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn with_tools(mut self, tools: Tools) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_readiness(mut self, policy: RetryPolicy) -> Self {
        self.readiness = policy;
        self
    }

    /// `key=value` pairs written with `sysctl -w` when the interface comes up.
    pub fn with_sysctls(mut self, sysctls: Vec<String>) -> Self {
        self.sysctls = sysctls;
        self
    }

    /// Resume from state applied by an earlier process.
    pub fn with_state(mut self, state: AppliedState) -> Self {
        self.state = state;
        self.phase = RouterPhase::Configured;
        self
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn state(&self) -> &AppliedState {
        &self.state
    }

    pub fn phase(&self) -> RouterPhase {
        self.phase
    }

    /// Brings the interface up, applies sysctls and waits for readiness.
    ///
    /// Only a failing `ifconfig <iface> up` is an error. Sysctl failures
    /// and a readiness timeout are logged.
    pub async fn up(&self) -> RouterResult<()> {
        let ifup = argv(&[self.tools.ifconfig.as_str(), self.iface.as_str(), "up"]);
        info!(iface = %self.iface, "bringing interface up");
        run_logged(self.runner.as_ref(), "ifconfig up", &ifup).await?;

        for setting in &self.sysctls {
            let cmd = argv(&[self.tools.sysctl.as_str(), "-w", setting.as_str()]);
            if run_logged(self.runner.as_ref(), "sysctl", &cmd).await.is_ok() {
                info!(setting = %setting, "applied sysctl");
            }
        }

        wait_until_up(
            self.runner.as_ref(),
            &self.tools.ifconfig,
            &self.iface,
            &self.readiness,
        )
        .await;
        Ok(())
    }

    /// Converges the interface to `desired`.
    ///
    /// `None` means "nothing": every address and route is removed. An
    /// invalid configuration is rejected before any command runs and leaves
    /// the state untouched. Otherwise addresses are applied, then routes,
    /// and the attempted configuration is recorded even if commands failed.
    /// The first failure is returned.
    pub async fn reconcile(&mut self, desired: Option<&DesiredConfig>) -> RouterResult<()> {
        let shutdown = DesiredConfig::default();
        let desired = desired.unwrap_or(&shutdown);
        info!(
            iface = %self.iface,
            local_addrs = ?desired.local_addrs,
            routes = desired.routes.len(),
            "reconciling"
        );

        let wanted = LocalAddrs::from_candidates(&desired.local_addrs)?;
        let prev_local = self.state.local_addrs();
        let mut errs = FirstError::default();

        let (local, addr_err) = apply_addresses(
            self.runner.as_ref(),
            &self.tools,
            &self.iface,
            &prev_local,
            &wanted,
        )
        .await;
        if let Some(err) = addr_err {
            errs.record(err);
        }

        let (routes, route_err) = apply_routes(
            self.runner.as_ref(),
            &self.tools,
            &self.iface,
            &self.state.routes,
            &desired.routes,
            &prev_local,
            &local,
        )
        .await;
        if let Some(err) = route_err {
            errs.record(err);
        }

        self.state = AppliedState {
            local_v4: local.v4,
            local_v6: local.v6,
            routes,
        };
        self.phase = RouterPhase::Configured;
        errs.into_result()
    }

    /// Brings the interface down. Applied state is dropped with the router.
    pub async fn close(self) {
        cleanup(self.runner.as_ref(), &self.tools, &self.iface).await;
    }
}

/// `ifconfig <iface> down`, logging failures.
///
/// Usable without a [`Router`], e.g. when cleaning up after a crash.
pub async fn cleanup<R>(runner: &R, tools: &Tools, iface: &str)
where
    R: CommandRunner + ?Sized,
{
    let ifdown = argv(&[tools.ifconfig.as_str(), iface, "down"]);
    info!(iface, "bringing interface down");
    if run_logged(runner, "ifconfig down", &ifdown).await.is_err() {
        warn!(iface, "interface may still be up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RecordingRunner;
    use crate::prefix::Prefix;
    use crate::router::RouterError;
    use std::time::Duration;

    fn p(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    fn router(runner: &Arc<RecordingRunner>) -> Router {
        Router::new("tun0", runner.clone())
            .with_readiness(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn starts_idle_and_becomes_configured() {
        let runner = Arc::new(RecordingRunner::new());
        let mut r = router(&runner);
        assert_eq!(r.phase(), RouterPhase::Idle);
        r.reconcile(None).await.unwrap();
        assert_eq!(r.phase(), RouterPhase::Configured);
        assert!(r.state().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_leaves_state_untouched() {
        let runner = Arc::new(RecordingRunner::new());
        let mut r = router(&runner);
        let good = DesiredConfig::new([p("100.64.0.7/32")], [p("10.0.0.0/24")]);
        r.reconcile(Some(&good)).await.unwrap();
        let before = r.state().clone();
        runner.take_calls();

        let bad = DesiredConfig::new([p("fd00::1/64"), p("fd00::2/64")], []);
        let err = r.reconcile(Some(&bad)).await.unwrap_err();
        assert!(matches!(err, RouterError::Configuration(_)));
        assert_eq!(r.state(), &before);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn address_failure_still_applies_routes() {
        let runner = Arc::new(RecordingRunner::new().fail_when(|a| a[0] == "ifconfig"));
        let mut r = router(&runner);
        let cfg = DesiredConfig::new([p("100.64.0.7/32")], [p("10.0.0.0/24")]);
        let err = r.reconcile(Some(&cfg)).await.unwrap_err();
        assert!(err.to_string().contains("ifconfig tun0 inet"));
        assert!(runner
            .calls()
            .contains(&argv(&["route", "-q", "-n", "add", "-inet", "10.0.0.0/24", "-iface", "100.64.0.7"])));
        assert_eq!(r.state().local_v4, Some(p("100.64.0.7/32")));
        assert!(r.state().routes.contains(&p("10.0.0.0/24")));
    }

    #[tokio::test]
    async fn address_error_wins_over_later_route_error() {
        let runner = Arc::new(
            RecordingRunner::new().fail_when(|a| a[0] == "ifconfig" || a[0] == "route"),
        );
        let mut r = router(&runner);
        let cfg = DesiredConfig::new([p("fd00::7/64")], [p("10.0.0.0/24")]);
        let err = r.reconcile(Some(&cfg)).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ifconfig tun0 inet6 fd00::/48 alias"), "{msg}");
        assert!(!msg.contains("route"), "{msg}");
        assert_eq!(runner.calls().len(), 2);
        assert!(r.state().routes.contains(&p("10.0.0.0/24")));
    }

    #[tokio::test]
    async fn up_applies_sysctls_and_waits() {
        let runner = Arc::new(
            RecordingRunner::new().respond_when(|a| a.len() == 2, "tun0: flags=0x51<UP>\n\tstatus: active\n"),
        );
        let r = router(&runner).with_sysctls(vec!["net.inet.udp.recvspace=1048576".into()]);
        r.up().await.unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                argv(&["ifconfig", "tun0", "up"]),
                argv(&["sysctl", "-w", "net.inet.udp.recvspace=1048576"]),
                argv(&["ifconfig", "tun0"]),
            ]
        );
    }

    #[tokio::test]
    async fn up_tolerates_readiness_timeout() {
        let runner = Arc::new(RecordingRunner::new().respond_when(|a| a.len() == 2, "status: down"));
        router(&runner).up().await.unwrap();
        assert_eq!(runner.calls().len(), 1 + 3);
    }

    #[tokio::test]
    async fn up_fails_when_ifconfig_up_fails() {
        let runner = Arc::new(RecordingRunner::new().fail_when(|a| a.last().map(String::as_str) == Some("up")));
        assert!(router(&runner).up().await.is_err());
    }

    #[tokio::test]
    async fn built_from_config() {
        let runner = Arc::new(RecordingRunner::new());
        let cfg = RouterConfig {
            interface: "tun9".into(),
            ifconfig: "/sbin/ifconfig".into(),
            sysctls: Vec::new(),
            ..RouterConfig::default()
        };
        let mut r = Router::from_config(&cfg, runner.clone());
        assert_eq!(r.iface(), "tun9");
        assert_eq!(r.tools().route, "route");
        r.reconcile(Some(&DesiredConfig::new([p("100.64.0.7/32")], [])))
            .await
            .unwrap();
        assert_eq!(runner.calls()[0][..2], argv(&["/sbin/ifconfig", "tun9"])[..]);
    }

    #[tokio::test]
    async fn close_brings_interface_down_without_diff() {
        let runner = Arc::new(RecordingRunner::new());
        let mut r = router(&runner);
        r.reconcile(Some(&DesiredConfig::new([p("100.64.0.7/32")], [p("10.0.0.0/24")])))
            .await
            .unwrap();
        runner.take_calls();
        r.close().await;
        assert_eq!(runner.calls(), vec![argv(&["ifconfig", "tun0", "down"])]);
    }
}
