use std::thread;

use tracing::{info, warn};

use vcdcrm_core::context::OpContext;
use vcdcrm_core::spec::VmGroupSpec;

use crate::orchestrator::Orchestrator;

/// Outcome of a batch of group operations.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    fn record(&mut self, name: String, res: vcdcrm_core::Result<()>, verb: &str) {
        match res {
            Ok(()) => self.succeeded.push(name),
            Err(e) => {
                warn!(group = %name, error = %e, "failed to {} group", verb);
                self.failed.push((name, e.to_string()));
            }
        }
    }
}

/// Run `op` over `items` on scoped threads, `concurrency` at a time.
fn run_chunked<T, F>(
    items: &[T],
    concurrency: usize,
    verb: &str,
    name: impl Fn(&T) -> String,
    op: F,
) -> BatchResult
where
    T: Sync,
    F: Fn(&T) -> vcdcrm_core::Result<()> + Sync,
{
    let op = &op;
    let mut result = BatchResult::default();
    for chunk in items.chunks(concurrency.max(1)) {
        let outcomes: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|item| (name(item), s.spawn(move || op(item))))
                .collect();
            handles
                .into_iter()
                .map(|(n, h)| (n, h.join()))
                .collect()
        });
        for (n, joined) in outcomes {
            match joined {
                Ok(res) => result.record(n, res, verb),
                Err(_) => {
                    warn!(group = %n, "{} thread panicked", verb);
                    result.failed.push((n, "thread panicked".to_string()));
                }
            }
        }
    }
    result
}

/// Create several groups concurrently.
///
/// Allocation goes through the shared inventory lock, so concurrent groups
/// never receive the same external address or internal network.
pub fn parallel_create(
    orch: &Orchestrator,
    ctx: &OpContext,
    specs: &[VmGroupSpec],
    max_concurrent: Option<usize>,
) -> BatchResult {
    let concurrency = max_concurrent.unwrap_or(orch.config().orchestrator.batch_concurrency);
    info!(count = specs.len(), concurrency, "creating groups in parallel");

    let result = run_chunked(specs, concurrency, "create", VmGroupSpec::group_name, |spec| {
        orch.create_group(ctx, spec)
    });

    info!(
        created = result.success_count(),
        failed = result.failure_count(),
        "parallel create complete"
    );
    result
}

/// Delete several groups concurrently.
pub fn parallel_delete(
    orch: &Orchestrator,
    ctx: &OpContext,
    groups: &[String],
    max_concurrent: Option<usize>,
) -> BatchResult {
    let concurrency = max_concurrent.unwrap_or(orch.config().orchestrator.batch_concurrency);
    info!(count = groups.len(), concurrency, "deleting groups in parallel");

    let result = run_chunked(groups, concurrency, "delete", String::clone, |group| {
        orch.delete_group(ctx, group)
    });

    info!(
        deleted = result.success_count(),
        failed = result.failure_count(),
        "parallel delete complete"
    );
    result
}
