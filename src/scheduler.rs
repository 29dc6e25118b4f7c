//! Scheduler loop: the cooperative, single-threaded tick that
//! drives the three periodic sub-tasks in strict priority order — send,
//! refresh, evaluate — then sleeps to the next whole second. A plain
//! `loop { tick().await }` with an explicit per-iteration ordering of
//! sub-steps and `tokio::time` driving the cadence.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::buffer::{BufferEntry, ResultBuffer};
use crate::config::Config;
use crate::error::CoreResult;
use crate::evaluator::{CheckEvaluator, EvalOutcome};
use crate::regexp::RegexpSet;
use crate::registry::{ActiveCheck, CheckRegistry};
use crate::session::ServerSession;
use crate::tailer::{self, EventLogTailer, FileTailer, LogSource, ParsedKey, NOT_SUPPORTED};
use crate::wire::is_success;

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Sink for the process-title/status-line update step 2 calls
/// for "set process title for observability" — the original bracketed
/// `get_active_checks` with `zbx_setproctitle` calls. The default sink just
/// logs; an embedder with a real title-setting syscall can supply its own.
pub trait ProcessTitle: Send + Sync {
    fn set(&self, title: &str);
}

#[derive(Debug, Default)]
pub struct LoggingProcessTitle;

impl ProcessTitle for LoggingProcessTitle {
    fn set(&self, title: &str) {
        debug!(title, "process title");
    }
}

/// One configured endpoint: an agent's view of a single server and its
/// check list.
pub struct Endpoint {
    config: Config,
    registry: CheckRegistry,
    regexps: RegexpSet,
    buffer: ResultBuffer,
    session: ServerSession,
    evaluator: Box<dyn CheckEvaluator>,
    sources: HashMap<String, Box<dyn LogSource>>,
    process_title: Box<dyn ProcessTitle>,
    next_refresh_at: i64,
    next_check_at: i64,
}

/// Flat retry delay after any refresh failure, transport or server-side.
const REFRESH_RETRY_SECS: i64 = 60;

impl Endpoint {
    pub fn new(config: Config, evaluator: Box<dyn CheckEvaluator>) -> Self {
        Self::with_process_title(config, evaluator, Box::new(LoggingProcessTitle))
    }

    pub fn with_process_title(
        config: Config,
        evaluator: Box<dyn CheckEvaluator>,
        process_title: Box<dyn ProcessTitle>,
    ) -> Self {
        let session = ServerSession::new(&config);
        let buffer = ResultBuffer::new(config.buffer_size);
        Endpoint {
            config,
            registry: CheckRegistry::new(),
            regexps: RegexpSet::new(),
            buffer,
            session,
            evaluator,
            sources: HashMap::new(),
            process_title,
            next_refresh_at: 0,
            next_check_at: 0,
        }
    }

    /// Run the scheduler forever. Never returns under normal
    /// operation; a transport error on any sub-task is logged and the loop
    /// continues rather than exiting. When the persistent reserve is still
    /// full after a tick, the next iteration starts immediately instead of
    /// sleeping, so the agent drains backlog as fast as the server accepts it.
    pub async fn run(&mut self) -> CoreResult<()> {
        loop {
            self.tick().await;
            if !self.buffer.persistent_reserve_full() {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    /// Run exactly one scheduler tick without the inter-tick sleep. Exposed
    /// for integration tests that need to observe state between ticks.
    pub async fn tick_once(&mut self) {
        self.tick().await;
    }

    pub fn buffer(&self) -> &ResultBuffer {
        &self.buffer
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    async fn tick(&mut self) {
        let now = now_epoch();

        if self.buffer.should_flush(self.config.buffer_send()) {
            if let Err(e) = self.do_send(now).await {
                warn!(error = %e, "send_buffer failed, retrying next tick");
            }
        }

        if now >= self.next_refresh_at {
            self.do_refresh(now).await;
        }

        if now >= self.next_check_at {
            self.do_evaluate(now).await;
        }
    }

    async fn do_send(&mut self, now: i64) -> CoreResult<()> {
        self.session.send_buffer(self.buffer.entries(), now).await?;
        self.buffer.clear_after_send();
        Ok(())
    }

    /// Refresh the active check list. On any failure — transport or
    /// server-reported — the next attempt is scheduled a flat 60s out rather
    /// than at the normal refresh cadence, to avoid busy-polling a down
    /// server. A server-reported failure additionally disables every check
    /// already in the registry, since the server has explicitly said it has
    /// nothing to offer this host.
    async fn do_refresh(&mut self, now: i64) {
        self.process_title.set(&format!("acheck-core: getting active checks from {}", self.config.server_host));
        info!(hostname = %self.config.hostname, "refreshing active checks");

        let reply = match self.session.refresh_active_checks(&self.config.hostname).await {
            Ok(reply) => reply,
            Err(e) => {
                self.process_title.set("acheck-core: idle");
                debug!(error = %e, "refresh_active_checks failed, retrying in 60s");
                self.next_refresh_at = now + REFRESH_RETRY_SECS;
                return;
            }
        };

        self.process_title.set("acheck-core: idle");

        if !is_success(&reply.response) {
            warn!(info = ?reply.info, "server refused active checks request, disabling all checks");
            self.registry.mark_all_not_supported();
            self.next_refresh_at = now + REFRESH_RETRY_SECS;
            return;
        }

        self.registry.apply_refresh(&reply);
        self.regexps.replace_from_rows(&reply.regexp);
        self.sources
            .retain(|key_orig, _| self.registry.get(key_orig).is_some_and(ActiveCheck::is_active));

        self.next_refresh_at = now + self.config.refresh_interval().as_secs() as i64;
    }

    /// Evaluate every runnable check in registry-insertion order. A check
    /// that hits backpressure (the persistent reserve is full) halts the
    /// rest of the pass for this tick; the skipped checks keep their
    /// current `nextCheckAt` so they're retried next tick. Afterwards,
    /// `next_check_at` is set to the earliest `nextCheckAt` across active
    /// checks (or `now + 60s` if none are runnable), gating the next pass.
    async fn do_evaluate(&mut self, now: i64) {
        let keys: Vec<String> = self
            .registry
            .iter()
            .filter(|c| c.is_runnable(now))
            .map(|c| c.key_orig.clone())
            .collect();

        for key_orig in keys {
            if self.buffer.persistent_reserve_full() {
                debug!("persistent reserve full, deferring remaining checks this tick");
                break;
            }
            self.evaluate_one(&key_orig, now).await;
        }

        self.next_check_at = self.registry.min_next_check().unwrap_or(now + 60);
    }

    async fn evaluate_one(&mut self, key_orig: &str, now: i64) {
        let Some(check) = self.registry.get(key_orig) else { return };
        let key = check.key.clone();
        let refresh = check.refresh;

        if tailer::parse_key(&key).is_some() {
            self.evaluate_log_check(key_orig, &key, refresh, now).await;
        } else {
            self.evaluate_plain_check(key_orig, &key, refresh, now).await;
        }
    }

    async fn evaluate_log_check(&mut self, key_orig: &str, key: &str, refresh: u64, now: i64) {
        let hostname = self.config.hostname.clone();

        let requested_cap = match tailer::parse_key(key) {
            Some(Ok(ParsedKey::Log { max_lines_per_second, .. }))
            | Some(Ok(ParsedKey::LogRt { max_lines_per_second, .. }))
            | Some(Ok(ParsedKey::EventLog { max_lines_per_second, .. })) => max_lines_per_second,
            _ => None,
        };
        let cap = self.config.clamp_lines_per_second(requested_cap);

        if !self.sources.contains_key(key_orig) {
            self.sources.insert(key_orig.to_string(), build_source(key));
        }

        let Some(check) = self.registry.get_mut(key_orig) else { return };
        let Some(source) = self.sources.get_mut(key_orig) else { return };

        let result = tailer::run_tick(check, source.as_mut(), &self.regexps, &mut self.buffer, &hostname, now, cap).await;

        if let Err(e) = result {
            warn!(key_orig, error = %e, "log check failed, marking not supported");
        }

        if let Some(check) = self.registry.get_mut(key_orig) {
            if check.is_active() {
                check.next_check_at = now + refresh as i64;
            }
        }
    }

    async fn evaluate_plain_check(&mut self, key_orig: &str, key: &str, refresh: u64, now: i64) {
        let outcome = self.evaluator.evaluate(key).await;

        let value = match outcome {
            Ok(EvalOutcome::Text(v)) => v,
            Ok(EvalOutcome::Message(m)) => {
                debug!(key, m, "check produced no value this tick");
                NOT_SUPPORTED.to_string()
            }
            Err(e) => {
                warn!(key, error = %e, "evaluator failed");
                NOT_SUPPORTED.to_string()
            }
        };

        let entry = BufferEntry::transient(self.config.hostname.clone(), key, value, now);
        let _ = self.buffer.enqueue(entry);

        if let Some(check) = self.registry.get_mut(key_orig) {
            check.next_check_at = now + refresh as i64;
        }
    }
}

fn build_source(key: &str) -> Box<dyn LogSource> {
    match tailer::parse_key(key) {
        Some(Ok(ParsedKey::Log { file, .. })) => Box::new(FileTailer::new(file, false)),
        Some(Ok(ParsedKey::LogRt { file, .. })) => Box::new(FileTailer::new(file, true)),
        _ => Box::new(EventLogTailer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::DefaultEvaluator;
    use crate::wire::{ActiveChecksReply, CheckRow, FlexInt};

    fn reply(rows: Vec<CheckRow>) -> ActiveChecksReply {
        ActiveChecksReply {
            response: "success".to_string(),
            data: rows,
            regexp: vec![],
            info: None,
        }
    }

    fn row(key: &str, delay: i64) -> CheckRow {
        CheckRow {
            key: Some(key.to_string()),
            key_orig: None,
            delay: Some(FlexInt(delay)),
            lastlogsize: Some(FlexInt(0)),
            mtime: None,
        }
    }

    #[test]
    fn test_endpoint_construction() {
        let config = Config::default();
        let endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        assert_eq!(endpoint.registry.len(), 0);
        assert_eq!(endpoint.next_refresh_at, 0);
        assert_eq!(endpoint.next_check_at, 0);
    }

    #[tokio::test]
    async fn test_evaluate_plain_check_enqueues_and_reschedules() {
        let config = Config::default();
        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        endpoint.registry.apply_refresh(&reply(vec![row("agent.ping", 30)]));

        endpoint.do_evaluate(1_000).await;

        assert_eq!(endpoint.buffer.len(), 1);
        assert_eq!(endpoint.buffer.entries()[0].value, "1");
        let check = endpoint.registry.get("agent.ping").unwrap();
        assert_eq!(check.next_check_at, 1_030);
    }

    #[tokio::test]
    async fn test_evaluate_skips_rest_of_tick_when_persistent_reserve_full() {
        let mut config = Config::default();
        config.buffer_size = 4;
        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        endpoint.registry.apply_refresh(&reply(vec![row("agent.ping", 30), row("agent.version", 30)]));

        endpoint
            .buffer
            .enqueue(BufferEntry::log_line("h1", "log[a]", "x", 1, 1, None, None))
            .unwrap();
        endpoint
            .buffer
            .enqueue(BufferEntry::log_line("h1", "log[b]", "x", 1, 1, None, None))
            .unwrap();

        endpoint.do_evaluate(1_000).await;

        // Persistent reserve was already full before the pass started, so
        // nothing new should have been evaluated this tick.
        assert_eq!(endpoint.buffer.len(), 2);
        assert_eq!(endpoint.registry.get("agent.ping").unwrap().next_check_at, 0);
    }

    #[tokio::test]
    async fn test_do_evaluate_sets_next_check_at_to_earliest_active_check() {
        let config = Config::default();
        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        endpoint
            .registry
            .apply_refresh(&reply(vec![row("agent.ping", 30), row("agent.version", 90)]));

        endpoint.do_evaluate(1_000).await;

        assert_eq!(endpoint.next_check_at, 1_030);
    }

    #[tokio::test]
    async fn test_do_evaluate_falls_back_to_now_plus_60_with_no_active_checks() {
        let config = Config::default();
        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));

        endpoint.do_evaluate(1_000).await;

        assert_eq!(endpoint.next_check_at, 1_060);
    }

    #[tokio::test]
    async fn test_do_refresh_server_failure_disables_all_checks_and_retries_in_60s() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            let reply = br#"{"response":"failed","info":"no host registered"}"#;
            sock.write_all(reply).await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let mut config = Config::default();
        config.server_host = "127.0.0.1".to_string();
        config.server_port = port;
        config.timeout_secs = 2;

        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        endpoint.registry.apply_refresh(&reply(vec![row("agent.ping", 30)]));
        assert!(endpoint.registry.get("agent.ping").unwrap().is_active());

        endpoint.do_refresh(1_000).await;
        server.await.unwrap();

        assert!(!endpoint.registry.get("agent.ping").unwrap().is_active());
        assert_eq!(endpoint.next_refresh_at, 1_000 + REFRESH_RETRY_SECS);
    }

    #[tokio::test]
    async fn test_do_refresh_transport_failure_retries_in_60s_without_disabling() {
        let mut config = Config::default();
        config.server_host = "127.0.0.1".to_string();
        config.server_port = 1; // nothing listens here
        config.timeout_secs = 1;

        let mut endpoint = Endpoint::new(config, Box::new(DefaultEvaluator));
        endpoint.registry.apply_refresh(&reply(vec![row("agent.ping", 30)]));

        endpoint.do_refresh(1_000).await;

        assert!(endpoint.registry.get("agent.ping").unwrap().is_active());
        assert_eq!(endpoint.next_refresh_at, 1_000 + REFRESH_RETRY_SECS);
    }
}
