use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hopline::client::ConnectOptions;
use hopline::config::AppConfig;
use hopline::heartbeat::Heartbeat;
use hopline::logging::{LogLevel, Logger};
use hopline::pools::ConnectionPool;
use hopline::producer::{ProducerConfig, ProducerLoop};
use hopline::runtime::{random_wid, RuntimeContext, Supervisor};
use hopline::shutdown::{ShutdownHooks, ShutdownToken};
use hopline::worker::{HandlerError, JobRegistry, WorkerConfig, WorkerLoop};
use serde_json::json;

const MAX_DEMO_SLEEP_MS: u64 = 60_000;

fn main() {
    ensure_posix_or_exit();

    let app_config = load_config_or_exit();
    let logger = Arc::new(Logger::new(app_config.logger_config()));

    let shutdown = ShutdownToken::new();
    let _shutdown_hooks = ShutdownHooks::install(&shutdown).unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let wid = random_wid();
    let options = ConnectOptions::from_app_config(&app_config, Some(wid.clone()));
    let pool = ConnectionPool::new(app_config.pool.capacity, options, Arc::clone(&logger))
        .unwrap_or_else(|error| {
            eprintln!("connection pool configuration error: {error}");
            process::exit(2);
        });
    if let Err(error) = pool.warm_up() {
        eprintln!(
            "failed to connect to broker at {}: {error}",
            app_config.broker.address
        );
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::broker"),
        &format!(
            "{} v{} connected to broker",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "address": app_config.broker.address,
            "wid": wid,
            "pool_capacity": app_config.pool.capacity,
            "labels": app_config.broker.labels,
        })),
    );

    let context = RuntimeContext::new(Arc::new(pool), shutdown, Arc::clone(&logger));
    let registry = Arc::new(demo_registry(Arc::clone(&logger)));

    let heartbeat = Heartbeat::from_app_config(context.clone(), &app_config).unwrap_or_else(|error| {
        eprintln!("heartbeat configuration error: {error}");
        process::exit(2);
    });

    let mut supervisor = Supervisor::new(Arc::clone(&logger));
    let mut spawned = spawn_task(&mut supervisor, &context, "heartbeat", move || {
        heartbeat.run();
    });

    for index in 1..=app_config.worker.concurrency {
        if !spawned {
            break;
        }
        let name = format!("worker-{index}");
        let worker = WorkerLoop::new(
            name.clone(),
            context.clone(),
            Arc::clone(&registry),
            WorkerConfig::from_app_config(&app_config),
        )
        .unwrap_or_else(|error| {
            eprintln!("worker configuration error: {error}");
            process::exit(2);
        });
        spawned = spawn_task(&mut supervisor, &context, name, move || {
            worker.run();
        });
    }

    if spawned && app_config.producer.enabled {
        let producer = ProducerLoop::new(context.clone(), ProducerConfig::from_app_config(&app_config));
        spawn_task(&mut supervisor, &context, "producer", move || {
            producer.run();
        });
    }

    let reports = supervisor.join_all();
    let mut failures = 0;
    for report in &reports {
        if report.is_success() {
            logger.log(
                LogLevel::Debug,
                Some("main::supervisor"),
                "Task finished",
                Some(report.log_payload()),
            );
        } else {
            failures += 1;
            logger.log(
                LogLevel::Error,
                Some("main::supervisor"),
                "Task ended abnormally",
                Some(report.log_payload()),
            );
        }
    }

    context.pool.close_all();
    logger.info(
        Some("main::shutdown"),
        &format!(
            "Shutdown completed, {} task(s) joined, {failures} abnormal",
            reports.len()
        ),
    );

    if failures > 0 {
        process::exit(1);
    }
}

fn spawn_task<F>(
    supervisor: &mut Supervisor,
    context: &RuntimeContext,
    name: impl Into<String>,
    task: F,
) -> bool
where
    F: FnOnce() + Send + 'static,
{
    let result = supervisor.spawn(name, move || {
        task();
        Ok::<(), String>(())
    });
    match result {
        Ok(()) => true,
        Err(error) => {
            context.logger.error(Some("main::supervisor"), &error.to_string());
            context.shutdown.trigger();
            false
        }
    }
}

fn demo_registry(logger: Arc<Logger>) -> JobRegistry {
    let mut registry = JobRegistry::new();

    registry.register("Echo", move |job| {
        logger.log(
            LogLevel::Info,
            Some("jobs::echo"),
            &format!("Echo {}", job.jid),
            Some(json!({ "args": job.args })),
        );
        Ok(())
    });

    registry.register("Sleep", |job| {
        let millis = job
            .args
            .first()
            .and_then(|value| value.as_u64())
            .ok_or_else(|| {
                HandlerError::new("Sleep expects a duration in milliseconds as its first argument")
                    .with_errtype("ArgumentError")
            })?;
        thread::sleep(Duration::from_millis(millis.min(MAX_DEMO_SLEEP_MS)));
        Ok(())
    });

    registry.register("Fail", |job| {
        let message = job
            .args
            .first()
            .and_then(|value| value.as_str())
            .unwrap_or("failure requested by job arguments");
        Err(HandlerError::new(message).with_errtype("RequestedFailure"))
    });

    registry
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: hopline is intended for POSIX systems");
        process::exit(2);
    }
}
