//! Clone submission and task waiting.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::customization::CustomizationSpec;
use crate::error::CloneError;
use crate::platform::{
    CloneSpec, ControlPlane, PlatformError, RelocationSpec, ResourceKind, ResourceRef, TaskInfo,
    TaskRef, TaskState, VmInfo,
};

/// Name of the snapshot taken on templates that have none.
pub const SNAPSHOT_NAME: &str = "vclone-base";

/// How task completion is awaited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskWaitPolicy {
    /// Delay between task state polls.
    pub poll_interval: Duration,
    /// Give up after this long; `None` waits for as long as the task runs.
    pub timeout: Option<Duration>,
}

impl Default for TaskWaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// A clone to submit.
#[derive(Debug, Clone)]
pub struct CloneRequest {
    /// Source template.
    pub template: ResourceRef,
    /// Name of the new VM.
    pub name: String,
    /// Destination folder.
    pub folder: ResourceRef,
    /// Placement.
    pub relocation: RelocationSpec,
    /// Guest customization.
    pub customization: Option<CustomizationSpec>,
    /// Produce a template instead of a powered-on VM.
    pub as_template: bool,
}

/// Result of a successful clone.
#[derive(Debug, Clone)]
pub struct ProvisionedVm {
    /// Handle to the new VM.
    pub vm: ResourceRef,
    /// Its summary right after the clone finished.
    pub summary: VmInfo,
}

/// Block until every task in `tasks` is terminal and return their final
/// states in the same order.
///
/// Failed tasks are returned, not raised; callers decide what a failure means.
///
/// # Errors
/// Returns `TaskTimeout` when `policy.timeout` elapses with tasks still
/// running, `Cancelled` when `cancel` fires, or the control-plane failure.
pub async fn wait_for_tasks<P: ControlPlane + ?Sized>(
    plane: &P,
    tasks: &[TaskRef],
    policy: &TaskWaitPolicy,
    cancel: &CancellationToken,
) -> Result<Vec<TaskInfo>, CloneError> {
    let start = Instant::now();
    let mut done: Vec<Option<TaskInfo>> = vec![None; tasks.len()];

    loop {
        for (task, slot) in tasks.iter().zip(done.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            let info = plane.task_info(task).await?;
            debug!(task = %task.id, description = %task.description, state = %info.state, "Polling task");
            if info.is_terminal() {
                *slot = Some(info);
            }
        }

        let pending = tasks
            .iter()
            .zip(&done)
            .find_map(|(task, info)| info.is_none().then_some(task));
        let Some(pending) = pending else {
            return Ok(done.into_iter().flatten().collect());
        };

        let mut pause = policy.poll_interval;
        if let Some(timeout) = policy.timeout {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(CloneError::TaskTimeout {
                    task: pending.description.clone(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            // never sleep past the deadline
            pause = pause.min(timeout - elapsed);
        }

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(CloneError::Cancelled(format!("waiting for task '{}'", pending.description)));
            }
            () = tokio::time::sleep(pause) => {}
        }
    }
}

async fn wait_for_task<P: ControlPlane + ?Sized>(
    plane: &P,
    task: TaskRef,
    policy: &TaskWaitPolicy,
    cancel: &CancellationToken,
) -> Result<TaskInfo, CloneError> {
    let info = wait_for_tasks(plane, std::slice::from_ref(&task), policy, cancel)
        .await?
        .pop()
        .ok_or_else(|| PlatformError::InvalidState(format!("no state for task {}", task.id)))?;

    if info.state == TaskState::Failed {
        return Err(CloneError::TaskFailure {
            task: task.description,
            detail: info.error.unwrap_or_default(),
        });
    }
    Ok(info)
}

/// First root snapshot of `template`, taking one when it has none.
///
/// An existing snapshot is reused as is. A new one is named
/// [`SNAPSHOT_NAME`] and captures neither memory nor a quiesced guest.
///
/// # Errors
/// Returns `TaskFailure` if the snapshot task fails and `NotFound` if the
/// template still lists no snapshot afterwards.
pub async fn ensure_snapshot<P: ControlPlane + ?Sized>(
    plane: &P,
    template: &ResourceRef,
    policy: &TaskWaitPolicy,
    cancel: &CancellationToken,
) -> Result<ResourceRef, CloneError> {
    let info = plane.vm_info(template).await?;
    if let Some(snapshot) = info.root_snapshots.into_iter().next() {
        debug!(template = %template.name, snapshot = %snapshot.name, "Reusing template snapshot");
        return Ok(snapshot);
    }

    info!(template = %template.name, snapshot = SNAPSHOT_NAME, "Template has no snapshot, creating one");
    let task = plane.create_snapshot(template, SNAPSHOT_NAME, false, false).await?;
    wait_for_task(plane, task, policy, cancel).await?;

    plane
        .vm_info(template)
        .await?
        .root_snapshots
        .into_iter()
        .next()
        .ok_or_else(|| CloneError::not_found(ResourceKind::Snapshot, SNAPSHOT_NAME))
}

/// Clone `request.template` and block until the clone task finishes.
///
/// The clone is based on the template's first root snapshot (taken first if
/// missing) and is powered on unless it is to become a template.
///
/// # Errors
/// Returns `TaskFailure` with the platform detail when the snapshot or clone
/// task fails, plus the errors of [`wait_for_tasks`].
pub async fn submit_clone<P: ControlPlane + ?Sized>(
    plane: &P,
    request: &CloneRequest,
    policy: &TaskWaitPolicy,
    cancel: &CancellationToken,
) -> Result<ProvisionedVm, CloneError> {
    let snapshot = ensure_snapshot(plane, &request.template, policy, cancel).await?;

    let spec = CloneSpec {
        location: request.relocation.clone(),
        power_on: !request.as_template,
        template: request.as_template,
        snapshot,
        customization: request.customization.clone(),
    };

    info!(
        vm = %request.name,
        power_on = spec.power_on,
        template = spec.template,
        folder = %request.folder.name,
        snapshot = %spec.snapshot.name,
        "Cloning VM"
    );

    let task = plane
        .clone_vm(&request.template, &request.name, &request.folder, &spec)
        .await?;
    let finished = wait_for_task(plane, task, policy, cancel).await?;

    let vm = finished.result.ok_or_else(|| {
        PlatformError::InvalidState(format!("clone task {} returned no VM", finished.task.id))
    })?;
    let summary = plane.vm_info(&vm).await?;

    info!(
        vm = %summary.name,
        vm_id = %vm.id,
        power_state = %summary.power_state,
        template = summary.template,
        nics = summary.nic_count,
        "Clone completed"
    );

    Ok(ProvisionedVm { vm, summary })
}
