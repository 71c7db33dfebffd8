//! Command recording and submission.
//!
//! An [`ExecPool`] owns a ring of [`ExecContext`]s on one queue role. Each
//! context records into its own command buffer, tracks the frames and other
//! objects a submission depends on, and paces reuse with a fence. Frames added
//! as dependencies are locked from [`ExecContext::add_frame`] until
//! [`ExecContext::submit`], so their timeline values and tracked state cannot
//! be torn by concurrent submissions.

use std::any::Any;
use std::fmt::Debug;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use ash::vk;

use crate::device::Device;
use crate::error::{Error, Result, VulkanError};
use crate::frame::Frame;
use crate::queue::{Queue, QueueRole};
use crate::sync::Fence;
use crate::utils::AsVkHandle;

/// What a frame is being transitioned for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepMode {
    /// General write, used after allocation to clear the undefined layout.
    Write,
    /// Retake ownership of a frame handed to an external API.
    ExternalImport,
    /// Hand ownership of a frame to an external API.
    ExternalExport,
    /// Decode output picture.
    DecodeDst,
    /// Decode reference picture.
    DecodeDpb,
}

impl PrepMode {
    fn layout(self) -> vk::ImageLayout {
        match self {
            PrepMode::Write => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            PrepMode::ExternalImport | PrepMode::ExternalExport => vk::ImageLayout::GENERAL,
            PrepMode::DecodeDst => vk::ImageLayout::VIDEO_DECODE_DST_KHR,
            PrepMode::DecodeDpb => vk::ImageLayout::VIDEO_DECODE_DPB_KHR,
        }
    }

    fn access(self) -> vk::AccessFlags2 {
        match self {
            PrepMode::Write | PrepMode::DecodeDst => vk::AccessFlags2::TRANSFER_WRITE,
            PrepMode::ExternalImport | PrepMode::ExternalExport => {
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE
            }
            PrepMode::DecodeDpb => {
                vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE
            }
        }
    }

    fn dst_queue_family(self) -> u32 {
        match self {
            PrepMode::ExternalExport => vk::QUEUE_FAMILY_EXTERNAL,
            _ => vk::QUEUE_FAMILY_IGNORED,
        }
    }

    fn src_stage(self) -> vk::PipelineStageFlags2 {
        match self {
            PrepMode::ExternalExport => vk::PipelineStageFlags2::ALL_COMMANDS,
            _ => vk::PipelineStageFlags2::NONE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ExecState {
    Idle,
    Recording,
    Submitted,
}

#[derive(Clone, Copy)]
struct FrameUpdate {
    layout: vk::ImageLayout,
    access: vk::AccessFlags2,
    queue_family: u32,
}

struct FrameDep {
    frame: Frame,
    locked: bool,
    /// Tracked state to fold into the frame once the submission is queued.
    /// Last barrier wins.
    update: Option<FrameUpdate>,
}

/// One command buffer plus everything its submission depends on.
pub struct ExecContext {
    device: Device,
    queue: Queue,
    pool: vk::CommandPool,
    buf: vk::CommandBuffer,
    fence: Fence,
    state: ExecState,
    had_submission: bool,
    frame_deps: Vec<FrameDep>,
    retained: Vec<Box<dyn Any + Send + Sync>>,
    wait_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
    signal_infos: Vec<vk::SemaphoreSubmitInfo<'static>>,
}

impl Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("buf", &self.buf)
            .field("state", &self.state)
            .field("frame_deps", &self.frame_deps.len())
            .finish()
    }
}

impl ExecContext {
    fn new(device: Device, queue: Queue) -> Result<Self> {
        let fence = Fence::new_signaled(device.clone())?;
        let pool_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: queue.family_index(),
            ..Default::default()
        };
        // Safety: no host synchronization rules for vkCreateCommandPool.
        let pool = unsafe { device.create_command_pool(&pool_info, None) }.map_err(|ret| {
            tracing::error!(result = ?ret, "failed to create command pool");
            VulkanError(ret)
        })?;
        let buf_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        // Safety: the pool was created above and is not in use elsewhere.
        let buf = match unsafe { device.allocate_command_buffers(&buf_info) } {
            Ok(bufs) => bufs[0],
            Err(ret) => {
                tracing::error!(result = ?ret, "failed to allocate command buffer");
                // Safety: nothing was allocated from the pool.
                unsafe { device.destroy_command_pool(pool, None) };
                return Err(VulkanError(ret).into());
            }
        };
        Ok(Self {
            device,
            queue,
            pool,
            buf,
            fence,
            state: ExecState::Idle,
            had_submission: false,
            frame_deps: Vec::new(),
            retained: Vec::new(),
            wait_infos: Vec::new(),
            signal_infos: Vec::new(),
        })
    }

    /// The raw command buffer, for recording between [`Self::begin`] and
    /// [`Self::submit`].
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.buf
    }

    /// The queue this context submits to.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Waits out any previous submission on this context, releases its
    /// dependencies and starts recording.
    pub fn begin(&mut self) -> Result<()> {
        self.fence.wait_and_reset()?;
        self.discard_deps();
        let info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        // Safety: the fence wait retired the previous submission, so the
        // buffer is no longer in the pending state.
        unsafe { self.device.begin_command_buffer(self.buf, &info) }.map_err(VulkanError)?;
        self.state = ExecState::Recording;
        Ok(())
    }

    /// Blocks until the last submission completes, then releases its
    /// dependencies. The fence stays signaled, so a following [`Self::begin`]
    /// will not wait again.
    pub fn wait_done(&mut self) -> Result<()> {
        let waited = self.fence.wait();
        self.discard_deps();
        self.state = ExecState::Idle;
        waited
    }

    /// Keeps `object` alive until this submission completes (strictly: until
    /// the next [`Self::begin`] or [`Self::wait_done`] observes the fence).
    pub fn retain<T: Send + Sync + 'static>(&mut self, object: T) {
        self.retained.push(Box::new(object));
    }

    /// Registers `frame` as a dependency of the pending submission.
    ///
    /// The frame is locked until [`Self::submit`] or the discard on failure.
    /// For every image, the submission waits for the current timeline value at
    /// `wait_stage` and signals the next one at `signal_stage`. Adding the
    /// same frame twice is a no-op.
    pub fn add_frame(
        &mut self,
        frame: &Frame,
        wait_stage: vk::PipelineStageFlags2,
        signal_stage: vk::PipelineStageFlags2,
    ) {
        assert_eq!(self.state, ExecState::Recording, "not recording");
        if self.frame_deps.iter().any(|dep| dep.frame == *frame) {
            return;
        }
        frame.lock();
        let states = frame.states();
        for (i, state) in states.iter().enumerate() {
            let semaphore = frame.semaphore(i).vk_handle();
            self.wait_infos.push(vk::SemaphoreSubmitInfo {
                semaphore,
                value: state.sem_value,
                stage_mask: wait_stage,
                ..Default::default()
            });
            self.signal_infos.push(vk::SemaphoreSubmitInfo {
                semaphore,
                value: state.sem_value + 1,
                stage_mask: signal_stage,
                ..Default::default()
            });
        }
        drop(states);
        self.frame_deps.push(FrameDep {
            frame: frame.clone(),
            locked: true,
            update: None,
        });
    }

    /// Records the tracked state `frame` should have after this submission.
    /// The frame must already be a dependency.
    pub fn update_frame(
        &mut self,
        frame: &Frame,
        layout: vk::ImageLayout,
        access: vk::AccessFlags2,
        queue_family: u32,
    ) {
        let dep = self
            .frame_deps
            .iter_mut()
            .find(|dep| dep.frame == *frame)
            .expect("frame is not a dependency");
        dep.update = Some(FrameUpdate {
            layout,
            access,
            queue_family,
        });
    }

    /// Appends one transition barrier per image of `frame` to `barriers` and
    /// registers the destination state via [`Self::update_frame`].
    ///
    /// Source state comes from a prior update in this context if one exists,
    /// otherwise from the frame's tracked state. The caller records the
    /// barriers with [`Self::emit_barriers`], batching frames if it wants.
    pub fn frame_barrier(
        &mut self,
        frame: &Frame,
        barriers: &mut Vec<vk::ImageMemoryBarrier2<'static>>,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
        new_access: vk::AccessFlags2,
        new_layout: vk::ImageLayout,
        new_queue_family: u32,
    ) {
        assert_eq!(self.state, ExecState::Recording, "not recording");
        let pending = self
            .frame_deps
            .iter()
            .find(|dep| dep.frame == *frame)
            .and_then(|dep| dep.update);
        {
            let states = frame.states();
            for (i, state) in states.iter().enumerate() {
                let (src_access, old_layout, src_queue_family) = match pending {
                    Some(update) => (update.access, update.layout, update.queue_family),
                    // Multi-image frames transition in lockstep, so image 0
                    // speaks for the layout and family of all of them.
                    None => (state.access, states[0].layout, states[0].queue_family),
                };
                barriers.push(vk::ImageMemoryBarrier2 {
                    src_stage_mask: src_stage,
                    dst_stage_mask: dst_stage,
                    src_access_mask: src_access,
                    dst_access_mask: new_access,
                    old_layout,
                    new_layout,
                    src_queue_family_index: src_queue_family,
                    dst_queue_family_index: new_queue_family,
                    image: frame.image(i),
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        level_count: vk::REMAINING_MIP_LEVELS,
                        layer_count: vk::REMAINING_ARRAY_LAYERS,
                        ..Default::default()
                    },
                    ..Default::default()
                });
            }
        }
        self.update_frame(frame, new_layout, new_access, new_queue_family);
    }

    /// Records an image barrier batch into the command buffer.
    pub fn emit_barriers(&mut self, image_barriers: &[vk::ImageMemoryBarrier2]) {
        assert_eq!(self.state, ExecState::Recording, "not recording");
        let dep_info = vk::DependencyInfo::default().image_memory_barriers(image_barriers);
        // Safety: the buffer is in the recording state.
        unsafe { self.device.cmd_pipeline_barrier2(self.buf, &dep_info) };
    }

    /// Ends recording and submits.
    ///
    /// On success the per-image timeline values of every frame dependency are
    /// advanced, pending state updates are folded into their frames, and the
    /// frames are unlocked. Dependency references stay alive until the next
    /// [`Self::begin`] or [`Self::wait_done`]. On failure every dependency is
    /// released with tracked state untouched.
    pub fn submit(&mut self) -> Result<()> {
        assert_eq!(self.state, ExecState::Recording, "not recording");
        // Safety: the buffer is in the recording state.
        if let Err(ret) = unsafe { self.device.end_command_buffer(self.buf) } {
            tracing::error!(result = ?ret, "failed to finish command buffer");
            self.discard_deps();
            self.state = ExecState::Idle;
            return Err(VulkanError(ret).into());
        }

        let buf_info = vk::CommandBufferSubmitInfo {
            command_buffer: self.buf,
            ..Default::default()
        };
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(std::slice::from_ref(&buf_info))
            .wait_semaphore_infos(&self.wait_infos)
            .signal_semaphore_infos(&self.signal_infos);
        if let Err(err) = self
            .queue
            .submit(std::slice::from_ref(&submit), self.fence.vk_handle())
        {
            tracing::error!(error = %err, "failed to submit command buffer");
            self.discard_deps();
            self.state = ExecState::Idle;
            return Err(err);
        }

        for dep in &mut self.frame_deps {
            if !dep.locked {
                continue;
            }
            {
                let mut states = dep.frame.states();
                for state in states.iter_mut() {
                    state.sem_value += 1;
                    if let Some(update) = dep.update {
                        state.layout = update.layout;
                        state.access = update.access;
                        state.queue_family = update.queue_family;
                    }
                }
            }
            dep.frame.unlock();
            dep.locked = false;
        }

        self.had_submission = true;
        self.state = ExecState::Submitted;
        Ok(())
    }

    /// Releases every dependency. Frames still locked by this context are
    /// unlocked without touching their tracked state.
    pub fn discard_deps(&mut self) {
        for dep in self.frame_deps.drain(..) {
            if dep.locked {
                dep.frame.unlock();
            }
        }
        self.retained.clear();
        self.wait_infos.clear();
        self.signal_infos.clear();
    }
}

impl Drop for ExecContext {
    fn drop(&mut self) {
        if self.had_submission {
            let _ = self.fence.wait();
        }
        self.discard_deps();
        // Safety: the fence wait retired any outstanding submission; the pool
        // frees the command buffer with it.
        unsafe { self.device.destroy_command_pool(self.pool, None) };
    }
}

/// A ring of execution contexts on one queue role.
///
/// Contexts are handed out round-robin and spread over the role's queues, so
/// concurrent callers land on different queues when the hardware has them.
pub struct ExecPool {
    contexts: Vec<Mutex<ExecContext>>,
    next: AtomicUsize,
}

impl ExecPool {
    /// Creates `count` contexts submitting to the queues assigned to `role`.
    /// Context `i` uses queue `i % queue_count` of the role's family.
    pub fn new(device: &Device, role: QueueRole, count: usize) -> Result<ExecPool> {
        assert!(count > 0);
        let mut contexts = Vec::with_capacity(count);
        for i in 0..count {
            let queue = device.queue(role, i as u32).ok_or(Error::NoQueues)?;
            contexts.push(Mutex::new(ExecContext::new(device.clone(), queue)?));
        }
        tracing::debug!(role = ?role, count, "created exec pool");
        Ok(ExecPool {
            contexts,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks the next context round-robin. Blocks while another thread holds
    /// the picked context.
    pub fn acquire(&self) -> ExecGuard<'_> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        ExecGuard(self.contexts[index].lock().unwrap())
    }

    /// Waits out every in-flight submission and releases all dependencies.
    pub fn wait_idle(&self) -> Result<()> {
        for context in &self.contexts {
            context.lock().unwrap().wait_done()?;
        }
        Ok(())
    }
}

/// Exclusive access to one [`ExecContext`] of a pool.
pub struct ExecGuard<'a>(MutexGuard<'a, ExecContext>);

impl Deref for ExecGuard<'_> {
    type Target = ExecContext;

    fn deref(&self) -> &ExecContext {
        &self.0
    }
}

impl DerefMut for ExecGuard<'_> {
    fn deref_mut(&mut self) -> &mut ExecContext {
        &mut self.0
    }
}

/// Transitions every image of `frame` for `mode` and updates its tracked
/// state. Blocks only on the context's previous submission, not on this one.
pub fn prepare_frame(pool: &ExecPool, frame: &Frame, mode: PrepMode) -> Result<()> {
    let mut exec = pool.acquire();
    exec.begin()?;
    exec.add_frame(
        frame,
        vk::PipelineStageFlags2::NONE,
        vk::PipelineStageFlags2::ALL_COMMANDS,
    );
    let mut barriers = Vec::with_capacity(frame.image_count());
    exec.frame_barrier(
        frame,
        &mut barriers,
        mode.src_stage(),
        vk::PipelineStageFlags2::ALL_COMMANDS,
        mode.access(),
        mode.layout(),
        mode.dst_queue_family(),
    );
    exec.emit_barriers(&barriers);
    exec.submit()?;
    // The submission holds no buffer references, so the dependencies can go
    // before the barrier executes.
    exec.discard_deps();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prep_mode_write() {
        assert_eq!(PrepMode::Write.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(PrepMode::Write.access(), vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(PrepMode::Write.dst_queue_family(), vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(PrepMode::Write.src_stage(), vk::PipelineStageFlags2::NONE);
    }

    #[test]
    fn prep_mode_external() {
        for mode in [PrepMode::ExternalImport, PrepMode::ExternalExport] {
            assert_eq!(mode.layout(), vk::ImageLayout::GENERAL);
            assert_eq!(
                mode.access(),
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE
            );
        }
        // Only the export direction releases ownership.
        assert_eq!(
            PrepMode::ExternalExport.dst_queue_family(),
            vk::QUEUE_FAMILY_EXTERNAL
        );
        assert_eq!(
            PrepMode::ExternalImport.dst_queue_family(),
            vk::QUEUE_FAMILY_IGNORED
        );
        assert_eq!(
            PrepMode::ExternalExport.src_stage(),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
    }

    #[test]
    fn prep_mode_decode() {
        assert_eq!(
            PrepMode::DecodeDst.layout(),
            vk::ImageLayout::VIDEO_DECODE_DST_KHR
        );
        assert_eq!(PrepMode::DecodeDst.access(), vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(
            PrepMode::DecodeDpb.layout(),
            vk::ImageLayout::VIDEO_DECODE_DPB_KHR
        );
        assert_eq!(
            PrepMode::DecodeDpb.access(),
            vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE
        );
    }
}
