#![forbid(unsafe_code)]
//! The move plan executor.
//!
//! Consumes a [`MovePlan`] step by step, strictly in order:
//! device-to-device copies go through a block-aligned bounce buffer,
//! storage transfers go directly through the mapped window (with an
//! `msync` before a storage step counts as durable). After every step
//! the `progress` marker is rewritten, so a crash resumes at the first
//! unexecuted step. There is no rollback: on I/O error the executor
//! halts and the persisted artifacts carry the job from there.

use rfs_device::{CancelToken, DeviceFile};
use rfs_error::{Result, RfsError};
use rfs_persist::{save_progress, Progress};
use rfs_plan::{MoveKind, MovePlan, MoveStep};
use rfs_storage::StorageWindow;
use std::path::PathBuf;
use tracing::{debug, info};

/// Bounce buffer size for device-to-device copies. Raised to one block
/// when blocks are larger than this.
const IO_CHUNK: usize = 1 << 20;

/// Executes a plan against an open device and storage window.
#[derive(Debug)]
pub struct Executor<'a> {
    device: &'a DeviceFile,
    window: &'a mut StorageWindow,
    plan: &'a MovePlan,
    job_dir: PathBuf,
    cancel: CancelToken,
    next_step: usize,
    buf: Vec<u8>,
}

impl<'a> Executor<'a> {
    /// `start_step` is the number of already-completed steps from the
    /// `progress` marker; a fresh job passes zero.
    pub fn new(
        device: &'a DeviceFile,
        window: &'a mut StorageWindow,
        plan: &'a MovePlan,
        job_dir: PathBuf,
        cancel: CancelToken,
        start_step: usize,
    ) -> Result<Self> {
        if start_step > plan.steps.len() {
            return Err(RfsError::Format(format!(
                "progress marker claims {start_step} of {} steps",
                plan.steps.len()
            )));
        }
        let block_size = usize::try_from(plan.block_bits.block_size())
            .map_err(|_| RfsError::Overflow("block size"))?;
        let chunk = IO_CHUNK.max(block_size);
        Ok(Self {
            device,
            window,
            plan,
            job_dir,
            cancel,
            next_step: start_step,
            buf: vec![0_u8; chunk],
        })
    }

    /// Steps still to execute.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.plan.steps.len() - self.next_step
    }

    /// Execute one step and persist progress. Returns `false` once the
    /// plan is exhausted.
    pub fn step(&mut self) -> Result<bool> {
        let Some(step) = self.plan.steps.get(self.next_step) else {
            return Ok(false);
        };
        self.cancel.checkpoint()?;

        debug!(
            target: "rfs::exec",
            step = self.next_step,
            kind = ?step.kind,
            src = step.src,
            dst = step.dst,
            length = step.length,
            "executing"
        );
        match step.kind {
            MoveKind::DevToDev => self.copy_dev_to_dev(step)?,
            MoveKind::DevToStorage => {
                let slice = self.window.slice_mut(step.dst, step.length)?;
                self.device.read_at(step.src, slice)?;
                // The kernel writes the window back asynchronously; the
                // step is durable only after msync.
                self.window.msync(step.dst, step.length)?;
            }
            MoveKind::StorageToDev => {
                let slice = self.window.slice(step.src, step.length)?;
                self.device.write_at(step.dst, slice)?;
            }
        }

        self.next_step += 1;
        save_progress(
            &self.job_dir,
            Progress {
                completed_steps: self.next_step,
                total_steps: self.plan.steps.len(),
            },
        )?;
        info!(
            target: "rfs::exec",
            completed = self.next_step,
            total = self.plan.steps.len(),
            "step done"
        );
        Ok(true)
    }

    /// Run the remaining steps to completion, then fsync the device.
    pub fn run(&mut self) -> Result<()> {
        if self.plan.is_empty() {
            save_progress(
                &self.job_dir,
                Progress {
                    completed_steps: 0,
                    total_steps: 0,
                },
            )?;
        }
        while self.step()? {}
        self.device.sync()?;
        Ok(())
    }

    fn copy_dev_to_dev(&mut self, step: &MoveStep) -> Result<()> {
        let mut moved = 0_u64;
        while moved < step.length {
            let chunk = to_usize((step.length - moved).min(self.buf.len() as u64))?;
            let buf = &mut self.buf[..chunk];
            self.device.read_at(step.src + moved, buf)?;
            self.device.write_at(step.dst + moved, buf)?;
            moved += chunk as u64;
        }
        Ok(())
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| RfsError::Overflow("step length"))
}
