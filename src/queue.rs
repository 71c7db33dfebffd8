//! Queue family planning.
//!
//! Before a logical device exists the planner decides, from the queue family
//! table alone, which families to create queues on and which functional role
//! each family serves. Roles are assigned in fixed priority order; each
//! assignment prefers the family with the fewest extraneous capability bits
//! and the fewest prior assignments, so work spreads across dedicated
//! families when the hardware has them.

use ash::vk;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::utils::AsVkHandle;

/// Functional roles queues are planned for, in assignment priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueRole {
    Graphics,
    Compute,
    Transfer,
    Encode,
    Decode,
}

impl QueueRole {
    pub const ALL: [QueueRole; 5] = [
        QueueRole::Graphics,
        QueueRole::Compute,
        QueueRole::Transfer,
        QueueRole::Encode,
        QueueRole::Decode,
    ];

    pub const fn required_flags(self) -> vk::QueueFlags {
        match self {
            QueueRole::Graphics => vk::QueueFlags::GRAPHICS,
            QueueRole::Compute => vk::QueueFlags::COMPUTE,
            QueueRole::Transfer => vk::QueueFlags::TRANSFER,
            QueueRole::Encode => vk::QueueFlags::VIDEO_ENCODE_KHR,
            QueueRole::Decode => vk::QueueFlags::VIDEO_DECODE_KHR,
        }
    }

    const fn idx(self) -> usize {
        self as usize
    }
}

/// One queue family the device will create queues on.
#[derive(Clone, Debug)]
pub struct PlannedFamily {
    pub index: u32,
    pub queue_count: u32,
    /// Equal priority weights, one per queue.
    pub priorities: Box<[f32]>,
}

/// A role's resolved queue family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleAssignment {
    pub family: u32,
    pub queue_count: u32,
}

/// The planner's output: distinct families to create, and the role mapping.
#[derive(Clone, Debug)]
pub struct QueuePlan {
    pub families: Vec<PlannedFamily>,
    roles: [Option<RoleAssignment>; 5],
}

impl QueuePlan {
    /// Assigns roles to queue families.
    ///
    /// Graphics, encode and decode are optional; compute and transfer are
    /// mandatory since every frame operation needs them. Transfer capability
    /// is optional to advertise, so a device without any transfer-flagged
    /// family falls back to the compute family, then the graphics family,
    /// both of which support transfers implicitly.
    ///
    /// Fails with [`Error::NoQueues`] only when the device reports zero queue
    /// families.
    pub fn plan(families: &[vk::QueueFamilyProperties]) -> Result<QueuePlan> {
        if families.is_empty() {
            tracing::error!("failed to get queues");
            return Err(Error::NoQueues);
        }

        for (i, f) in families.iter().enumerate() {
            tracing::trace!(
                family = i,
                flags = ?f.queue_flags,
                queues = f.queue_count,
                "queue family"
            );
        }

        let mut uses = vec![0u32; families.len()];
        let graphics = pick_family(families, &mut uses, vk::QueueFlags::GRAPHICS);
        let compute = pick_family(families, &mut uses, vk::QueueFlags::COMPUTE);
        let mut transfer = pick_family(families, &mut uses, vk::QueueFlags::TRANSFER);
        let encode = pick_family(families, &mut uses, vk::QueueFlags::VIDEO_ENCODE_KHR);
        let decode = pick_family(families, &mut uses, vk::QueueFlags::VIDEO_DECODE_KHR);

        // Advertising the transfer bit is optional for families that support
        // compute or graphics.
        if transfer.is_none() {
            transfer = pick_family(families, &mut uses, vk::QueueFlags::COMPUTE)
                .or_else(|| pick_family(families, &mut uses, vk::QueueFlags::GRAPHICS));
        }

        let compute =
            compute.ok_or_else(|| Error::Unsupported("no queue family supports compute".into()))?;
        let transfer = transfer
            .ok_or_else(|| Error::Unsupported("no queue family supports transfers".into()))?;

        let mut plan = QueuePlan {
            families: Vec::new(),
            roles: [None; 5],
        };
        let picks = [
            (QueueRole::Graphics, graphics),
            (QueueRole::Compute, Some(compute)),
            (QueueRole::Transfer, Some(transfer)),
            (QueueRole::Encode, encode),
            (QueueRole::Decode, decode),
        ];
        for (role, family) in picks {
            let Some(family) = family else { continue };
            let queue_count = families[family].queue_count;
            plan.roles[role.idx()] = Some(RoleAssignment {
                family: family as u32,
                queue_count,
            });
            if !plan.families.iter().any(|f| f.index == family as u32) {
                plan.families.push(PlannedFamily {
                    index: family as u32,
                    queue_count,
                    priorities: vec![1.0 / queue_count as f32; queue_count as usize]
                        .into_boxed_slice(),
                });
            }
        }

        for family in &plan.families {
            let mut roles = String::new();
            for role in QueueRole::ALL {
                if plan.roles[role.idx()].map(|a| a.family) == Some(family.index) {
                    roles.push_str(&format!(" {role:?}"));
                }
            }
            tracing::trace!(
                family = family.index,
                queues = family.queue_count,
                roles = roles.trim_start(),
                "using queue family"
            );
        }

        Ok(plan)
    }

    pub fn role(&self, role: QueueRole) -> Option<RoleAssignment> {
        self.roles[role.idx()]
    }

    /// Families whose queues may touch frame images; more than one forces
    /// concurrent sharing mode.
    pub fn image_sharing_families(&self) -> Vec<u32> {
        self.families.iter().map(|f| f.index).collect()
    }
}

/// A device queue.
///
/// Submissions go through [`Queue::submit`], which serializes access across
/// the process via the device's queue lock table.
#[derive(Clone)]
pub struct Queue {
    device: Device,
    handle: vk::Queue,
    family: u32,
    index: u32,
}

impl Queue {
    pub(crate) fn from_raw(device: Device, handle: vk::Queue, family: u32, index: u32) -> Self {
        Self {
            device,
            handle,
            family,
            index,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn family_index(&self) -> u32 {
        self.family
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Submits command batches under the queue's lock.
    pub fn submit(&self, submits: &[vk::SubmitInfo2], fence: vk::Fence) -> Result<()> {
        let _guard = self.device.lock_queue(self.family, self.index);
        // Safety: host access to the queue is serialized by the guard.
        unsafe { self.device.queue_submit2(self.handle, submits, fence) }?;
        Ok(())
    }

    /// Blocks until all submitted work on this queue completes.
    pub fn wait_idle(&self) -> Result<()> {
        let _guard = self.device.lock_queue(self.family, self.index);
        // Safety: host access to the queue is serialized by the guard.
        unsafe { self.device.queue_wait_idle(self.handle) }?;
        Ok(())
    }
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;

    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

/// Picks the least used family with the fewest unneeded flags, if any
/// advertises `flags`.
fn pick_family(
    families: &[vk::QueueFamilyProperties],
    uses: &mut [u32],
    flags: vk::QueueFlags,
) -> Option<usize> {
    let mut index = None;
    let mut min_score = u32::MAX;
    for (i, f) in families.iter().enumerate() {
        if f.queue_flags.intersects(flags) {
            let score = f.queue_flags.as_raw().count_ones() + uses[i];
            if score < min_score {
                index = Some(i);
                min_score = score;
            }
        }
    }
    if let Some(i) = index {
        uses[i] += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn zero_families_is_no_queues() {
        assert!(matches!(QueuePlan::plan(&[]), Err(Error::NoQueues)));
    }

    #[test]
    fn do_everything_family_satisfies_all_roles() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            4,
        )];
        let plan = QueuePlan::plan(&families).unwrap();
        assert_eq!(plan.families.len(), 1);
        assert_eq!(plan.families[0].queue_count, 4);
        for role in [QueueRole::Graphics, QueueRole::Compute, QueueRole::Transfer] {
            assert_eq!(
                plan.role(role),
                Some(RoleAssignment {
                    family: 0,
                    queue_count: 4
                })
            );
        }
        assert_eq!(plan.role(QueueRole::Encode), None);
    }

    #[test]
    fn dedicated_families_win_on_score() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let plan = QueuePlan::plan(&families).unwrap();
        assert_eq!(plan.role(QueueRole::Graphics).unwrap().family, 0);
        assert_eq!(plan.role(QueueRole::Compute).unwrap().family, 1);
        assert_eq!(plan.role(QueueRole::Transfer).unwrap().family, 2);
        assert_eq!(plan.families.len(), 3);
    }

    #[test]
    fn reuse_counter_spreads_roles() {
        // Two identical families: the second role assignment must move to the
        // family not yet used.
        let families = [
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 1),
        ];
        let plan = QueuePlan::plan(&families).unwrap();
        let compute = plan.role(QueueRole::Compute).unwrap().family;
        let transfer = plan.role(QueueRole::Transfer).unwrap().family;
        assert_ne!(compute, transfer);
    }

    #[test]
    fn transfer_falls_back_to_compute_then_graphics() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        let plan = QueuePlan::plan(&families).unwrap();
        // No family advertises TRANSFER; the compute pick serves transfers.
        assert_eq!(plan.role(QueueRole::Transfer).unwrap().family, 1);

        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1)];
        let plan = QueuePlan::plan(&families).unwrap();
        assert_eq!(plan.role(QueueRole::Transfer).unwrap().family, 0);
    }

    #[test]
    fn missing_compute_is_unsupported() {
        let families = [family(vk::QueueFlags::GRAPHICS, 1)];
        assert!(matches!(
            QueuePlan::plan(&families),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn video_roles_use_video_families() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                1,
            ),
            family(vk::QueueFlags::VIDEO_DECODE_KHR, 1),
            family(vk::QueueFlags::VIDEO_ENCODE_KHR, 1),
        ];
        let plan = QueuePlan::plan(&families).unwrap();
        assert_eq!(plan.role(QueueRole::Decode).unwrap().family, 1);
        assert_eq!(plan.role(QueueRole::Encode).unwrap().family, 2);
        assert_eq!(plan.families.len(), 3);
    }

    #[test]
    fn priorities_are_equal_weights() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            4,
        )];
        let plan = QueuePlan::plan(&families).unwrap();
        let priorities = &plan.families[0].priorities;
        assert_eq!(priorities.len(), 4);
        for &p in priorities.iter() {
            assert!((p - 0.25).abs() < f32::EPSILON);
        }
    }
}
