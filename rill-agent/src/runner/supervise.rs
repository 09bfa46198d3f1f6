//! The cooperative supervision loop shared by `supervise` and `reconcile`.

use super::deliver::{pump, INPUT_CHANNEL_CAPACITY};
use super::{open_delivery, TapStream};
use crate::bus::{Message, Subscriber};
use crate::config::Config;
use crate::delivery::Delivery;
use crate::envelope::StreamChunk;
use crate::liveness::LivenessConsumer;
use crate::parsers::{line_preview, LINE_PREVIEW_LIMIT};
use crate::supervisor::{ProcessLauncher, ShellLauncher, SupervisionPlan, Supervisor};
use anyhow::Result;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LIVENESS_CHANNEL_CAPACITY: usize = 64;
const WATCHDOG_CHANNEL_CAPACITY: usize = 64;

/// Run `plan` until `cancel_token` fires, then stop every child.
pub async fn run(config: &Config, plan: SupervisionPlan, cancel_token: CancellationToken) -> Result<()> {
    let launcher = ShellLauncher::new(config.processes.verbose);
    let delivery = match plan.envelope_addr {
        Some(_) => Some(open_delivery(config, cancel_token.clone()).await?),
        None => None,
    };
    run_with_launcher(config, plan, launcher, delivery, cancel_token).await
}

/// `delivery` is driven on its own task so a slow store never delays `step`.
pub async fn run_with_launcher<L: ProcessLauncher>(
    config: &Config,
    plan: SupervisionPlan,
    launcher: L,
    delivery: Option<Delivery>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let name = plan.settings.name.clone();
    let poll_interval = config.poll_interval();
    let now = Instant::now();

    let liveness = LivenessConsumer::from_config(config, now);
    let mut liveness_feed = config
        .bus
        .liveness_addr
        .as_deref()
        .map(|addr| {
            Subscriber::connect(addr, liveness.topic_filters(), LIVENESS_CHANNEL_CAPACITY, &cancel_token)
        })
        .transpose()?;
    let mut watchdog_feed = plan
        .watchdog_addr
        .as_deref()
        .map(|addr| Subscriber::connect(addr, Vec::new(), WATCHDOG_CHANNEL_CAPACITY, &cancel_token))
        .transpose()?;
    let delivery_task = match (plan.envelope_addr.as_deref(), delivery) {
        (Some(addr), Some(delivery)) => {
            let envelopes = Subscriber::connect(addr, Vec::new(), INPUT_CHANNEL_CAPACITY, &cancel_token)?;
            Some(tokio::spawn(pump(
                delivery,
                envelopes,
                poll_interval,
                cancel_token.clone(),
            )))
        }
        _ => None,
    };

    let mut supervisor = Supervisor::new(plan.settings, plan.commands, launcher, liveness, now);
    let mut watchdog_stream = TapStream::new();

    info!(
        supervisor = %name,
        liveness = liveness_feed.is_some(),
        watchdog = watchdog_feed.is_some(),
        inline_delivery = delivery_task.is_some(),
        "supervisor started"
    );

    loop {
        let now = Instant::now();
        supervisor.step(now);

        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            Some(message) = next_message(&mut liveness_feed) => {
                supervisor.liveness_mut().observe_message(&message, Instant::now());
            }
            Some(message) = next_message(&mut watchdog_feed) => {
                match StreamChunk::decode(message.payload()) {
                    Ok(chunk) => {
                        watchdog_stream.switch_session(&chunk);
                        for line in watchdog_stream.lines(&chunk) {
                            supervisor.observe_watchdog_line(&line, Instant::now());
                        }
                    }
                    Err(err) => debug!(
                        error = %err,
                        payload = %line_preview(message.payload(), LINE_PREVIEW_LIMIT),
                        "dropping invalid watchdog message"
                    ),
                }
            }
            _ = sleep(poll_interval) => {}
        }
    }

    info!(supervisor = %name, "shutting down");
    supervisor.shutdown().await;
    if let Some(task) = delivery_task {
        if let Err(err) = task.await {
            warn!(supervisor = %name, error = %err, "delivery task failed");
        }
    }
    Ok(())
}

async fn next_message(feed: &mut Option<Subscriber>) -> Option<Message> {
    match feed {
        Some(subscriber) => subscriber.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{AcceptanceWindow, Accumulator};
    use crate::bus::{BusSettings, Publisher};
    use crate::envelope::Envelope;
    use crate::record::{DateParts, ParsedRecord};
    use crate::retry::RetryPolicy;
    use crate::store::{DocumentStore, InsertReport, StoreError};
    use crate::supervisor::plan::tests::config;
    use crate::supervisor::{ManagedProcess, Role};
    use async_trait::async_trait;
    use chrono::{NaiveDateTime, Utc};
    use serde_json::{Map, Value};
    use std::collections::BTreeSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Launches {
        started: Vec<Role>,
        terminated: Vec<Role>,
    }

    struct RecordingProcess {
        role: Role,
        launches: Arc<Mutex<Launches>>,
        exited: bool,
    }

    impl ManagedProcess for RecordingProcess {
        fn id(&self) -> Option<u32> {
            None
        }

        fn try_wait(&mut self) -> Result<Option<i32>> {
            Ok(self.exited.then_some(143))
        }

        fn terminate(&mut self) -> Result<()> {
            self.launches.lock().expect("launches").terminated.push(self.role);
            self.exited = true;
            Ok(())
        }

        fn kill(&mut self) -> Result<()> {
            self.exited = true;
            Ok(())
        }
    }

    struct RecordingLauncher {
        launches: Arc<Mutex<Launches>>,
        /// Processes of this role exit as soon as they are started.
        short_lived: Option<Role>,
    }

    impl ProcessLauncher for RecordingLauncher {
        fn launch(&mut self, role: Role, _command: &str) -> Result<Box<dyn ManagedProcess>> {
            self.launches.lock().expect("launches").started.push(role);
            Ok(Box::new(RecordingProcess {
                role,
                launches: self.launches.clone(),
                exited: self.short_lived == Some(role),
            }))
        }
    }

    /// Accepts the collection, then never answers an insert.
    struct StalledStore {
        inserting: Arc<AtomicBool>,
    }

    #[async_trait]
    impl DocumentStore for StalledStore {
        async fn ensure_indexes(&self, _collection: &str, _fields: &[String]) -> Result<(), StoreError> {
            Ok(())
        }

        async fn insert_many(
            &self,
            _collection: &str,
            _documents: Vec<crate::store::Document>,
        ) -> Result<InsertReport, StoreError> {
            self.inserting.store(true, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn prune_outside(
            &self,
            _collection: &str,
            _oldest: NaiveDateTime,
            _newest: NaiveDateTime,
            _block_size: usize,
        ) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn count(&self, _collection: &str) -> Result<usize, StoreError> {
            Ok(0)
        }

        async fn recent(&self, _collection: &str, _limit: usize) -> Result<Vec<Map<String, Value>>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn started(launches: &Mutex<Launches>, role: Role) -> usize {
        let launches = launches.lock().expect("launches");
        launches.started.iter().filter(|started| **started == role).count()
    }

    #[tokio::test]
    async fn loop_starts_children_and_stops_them_on_cancel() {
        let mut config = config("");
        config.bus.poll_interval_ms = 10;
        let plan = SupervisionPlan::live(&config, Path::new("/etc/rill/ep.toml")).expect("plan");

        let launches = Arc::new(Mutex::new(Launches::default()));
        let launcher = RecordingLauncher {
            launches: launches.clone(),
            short_lived: None,
        };
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { run_with_launcher(&config, plan, launcher, None, cancel).await }
        });

        for _ in 0..200 {
            if launches.lock().expect("launches").started.len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop stops in time")
            .expect("task joins")
            .expect("loop succeeds");

        let launches = launches.lock().expect("launches");
        assert_eq!(launches.started, vec![Role::Parser, Role::Watchdog, Role::Tail]);
        let mut terminated = launches.terminated.clone();
        terminated.sort();
        assert_eq!(terminated, vec![Role::Tail, Role::Watchdog, Role::Parser]);
    }

    #[tokio::test]
    async fn stalled_store_does_not_stall_supervision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = CancellationToken::new();
        let settings = BusSettings {
            high_water_mark: 16,
            spill_dir: dir.path().to_path_buf(),
            max_spill_bytes: 1 << 20,
        };
        let parser_output = Publisher::bind("127.0.0.1:0", settings, &cancel)
            .await
            .expect("bind");

        let mut config = config("");
        config.bus.poll_interval_ms = 10;
        config.bus.parser_addr = parser_output.local_addr().to_string();
        let plan = SupervisionPlan::live(&config, Path::new("/etc/rill/ep.toml")).expect("plan");
        assert!(plan.envelope_addr.is_some());

        let inserting = Arc::new(AtomicBool::new(false));
        let store = Arc::new(StalledStore {
            inserting: inserting.clone(),
        });
        let delivery = Delivery::open(
            store,
            "jabbah2_ep".to_string(),
            &[],
            Accumulator::new(1, Duration::ZERO, AcceptanceWindow::from_days(5, 1)),
            RetryPolicy::default(),
            cancel.clone(),
        )
        .await
        .expect("open delivery");

        // A parser that keeps dying is restarted on every step.
        let launches = Arc::new(Mutex::new(Launches::default()));
        let launcher = RecordingLauncher {
            launches: launches.clone(),
            short_lived: Some(Role::Parser),
        };
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { run_with_launcher(&config, plan, launcher, Some(delivery), cancel).await }
        });

        for _ in 0..200 {
            if parser_output.subscriber_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = ParsedRecord::new(
            "Feb 28 23:30:51 jabbah kernel: eth0 up".to_string(),
            DateParts::from_datetime(Utc::now().naive_utc(), None),
            BTreeSet::new(),
        );
        let envelope = Envelope::from_record(&record).encode().expect("encode");
        parser_output
            .publish(&Message::single(envelope))
            .await
            .expect("publish");

        for _ in 0..200 {
            if inserting.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inserting.load(Ordering::SeqCst), "insert never reached the store");

        let before = started(&launches, Role::Parser);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = started(&launches, Role::Parser);
        assert!(after >= before + 5, "supervisor stepped {} times", after - before);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("loop stops in time")
            .expect("task joins")
            .expect("loop succeeds");
    }
}
