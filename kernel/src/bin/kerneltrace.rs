//! A small CLI that drives the kernel through a handful of scenarios and
//! logs what happens, exercising a live kernel instead of asserting on it
//! silently.

use anyhow::Result;
use clap::{Parser, Subcommand};

use task_kernel::cancellation::disable_cancellation;
use task_kernel::config::KernelConfig;
use task_kernel::error::{CancellationError, KernelError, UserError};
use task_kernel::kernel::Kernel;
use task_kernel::task_group::WaitPolicy;
use task_kernel::timeout::timeout_after;
use task_kernel::trap;

#[derive(Parser)]
#[command(name = "kerneltrace", about = "Exercise the task kernel and trace what it does")]
struct Cli {
    #[command(subcommand)]
    scenario: Scenario,

    /// Log every trap dispatch at TRACE level.
    #[arg(long, global = true)]
    trace_syscalls: bool,
}

#[derive(Subcommand)]
enum Scenario {
    /// A single task sleeping for `seconds`.
    Sleep { seconds: f64 },
    /// A nested `timeout_after(outer)` wrapping `timeout_after(inner)`
    /// around a long sleep, reporting which of the three nested-timeout
    /// outcomes actually fired.
    Timeout { outer: f64, inner: f64 },
    /// A task group of `count` sleepers with the given wait policy,
    /// reporting which ones actually finished.
    Group {
        count: u64,
        #[arg(value_enum)]
        policy: GroupPolicy,
    },
    /// A task that disables cancellation, sleeps, and reports that the
    /// outer cancellation it raced with stayed pending until it let go of
    /// the shield.
    Shielded { shield_seconds: f64 },
}

#[derive(Clone, clap::ValueEnum)]
enum GroupPolicy {
    All,
    Any,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kerneltrace=info")),
        )
        .init();

    let config = KernelConfig::builder()
        .trace_syscalls(cli.trace_syscalls)
        .build();
    let kernel = Kernel::new(config)?;

    match cli.scenario {
        Scenario::Sleep { seconds } => run_sleep(&kernel, seconds),
        Scenario::Timeout { outer, inner } => run_timeout(&kernel, outer, inner),
        Scenario::Group { count, policy } => run_group(&kernel, count, policy),
        Scenario::Shielded { shield_seconds } => run_shielded(&kernel, shield_seconds),
    }
    Ok(())
}

fn to_user_error(e: KernelError) -> UserError {
    UserError::new(std::io::Error::other(e.to_string()))
}

fn run_sleep(kernel: &Kernel, seconds: f64) {
    tracing::info!(seconds, "sleeping");
    let result = kernel.run(async move {
        trap::sleep(seconds).await.map_err(to_user_error)?;
        Ok::<_, UserError>(())
    });
    tracing::info!(?result, "sleep scenario finished");
}

fn run_timeout(kernel: &Kernel, outer: f64, inner: f64) {
    tracing::info!(outer, inner, "running nested timeout scenario");
    let result = kernel.run(async move {
        let outcome = timeout_after(outer, async move {
            timeout_after(inner, async move {
                trap::sleep(1000.0).await?;
                Ok::<_, KernelError>(())
            })
            .await
        })
        .await;
        let label = match outcome {
            Ok(()) => "completed",
            Err(KernelError::Cancelled(CancellationError::TaskTimeout { .. })) => {
                "inner-or-own-timeout"
            }
            Err(KernelError::UncaughtTimeoutError { .. }) => "uncaught-inner-timeout",
            Err(_) => "other-error",
        };
        Ok::<_, UserError>(label)
    });
    tracing::info!(?result, "timeout scenario finished");
}

fn run_group(kernel: &Kernel, count: u64, policy: GroupPolicy) {
    let wait_policy = match policy {
        GroupPolicy::All => WaitPolicy::All,
        GroupPolicy::Any => WaitPolicy::Any,
    };
    tracing::info!(count, "spawning task group");
    let run_kernel = kernel.clone();
    let finished: Result<Vec<u64>, KernelError> = kernel.run(async move {
        let group = run_kernel.task_group::<u64>(wait_policy);
        for i in 0..count {
            group.spawn(async move {
                trap::sleep(0.01 * (i as f64 + 1.0))
                    .await
                    .map_err(to_user_error)?;
                Ok::<_, UserError>(i)
            });
        }
        group.join().await.map_err(to_user_error)?;
        let mut values = Vec::new();
        for handle in group.results() {
            if let Ok(v) = handle.join().await {
                values.push(*v);
            }
        }
        Ok::<_, UserError>(values)
    });
    tracing::info!(?finished, "group scenario finished");
}

fn run_shielded(kernel: &Kernel, shield_seconds: f64) {
    tracing::info!(shield_seconds, "running shielded-region scenario");
    let run_kernel = kernel.clone();
    let result: Result<(), KernelError> = kernel.run(async move {
        let handle = run_kernel.spawn(
            async move {
                disable_cancellation(async {
                    trap::sleep(shield_seconds).await.ok();
                    tracing::info!("shield held through the race, ran to completion");
                    Ok::<(), KernelError>(())
                })
                .await
                .map_err(to_user_error)?;
                let pending = task_kernel::cancellation::check_cancellation();
                tracing::info!(?pending, "cancellation delivered once the shield lifted");
                Ok::<_, UserError>(())
            },
            false,
        );
        trap::sleep(0.0).await.map_err(to_user_error)?;
        handle.cancel(true).await;
        Ok::<_, UserError>(())
    });
    tracing::info!(?result, "shielded scenario finished");
}
