use ash::vk;

use crate::error::{Error, Result};
use crate::format::{FormatEntry, PixelFormat};

/// Format feature bits every usable representation must expose.
pub const BASIC_FEATURES: vk::FormatFeatureFlags2 = vk::FormatFeatureFlags2::from_raw(
    vk::FormatFeatureFlags2::SAMPLED_IMAGE.as_raw()
        | vk::FormatFeatureFlags2::TRANSFER_SRC.as_raw()
        | vk::FormatFeatureFlags2::TRANSFER_DST.as_raw(),
);

/// Feature/usage bit pairs. Both mapping directions walk this one table so
/// they cannot drift apart.
#[rustfmt::skip]
const FEATURE_USAGE_MAP: &[(vk::FormatFeatureFlags2, vk::ImageUsageFlags)] = &[
    (vk::FormatFeatureFlags2::SAMPLED_IMAGE,          vk::ImageUsageFlags::SAMPLED),
    (vk::FormatFeatureFlags2::TRANSFER_SRC,           vk::ImageUsageFlags::TRANSFER_SRC),
    (vk::FormatFeatureFlags2::TRANSFER_DST,           vk::ImageUsageFlags::TRANSFER_DST),
    (vk::FormatFeatureFlags2::STORAGE_IMAGE,          vk::ImageUsageFlags::STORAGE),
    (vk::FormatFeatureFlags2::COLOR_ATTACHMENT,       vk::ImageUsageFlags::COLOR_ATTACHMENT),
    (vk::FormatFeatureFlags2::VIDEO_DECODE_OUTPUT_KHR, vk::ImageUsageFlags::VIDEO_DECODE_DST_KHR),
    (vk::FormatFeatureFlags2::VIDEO_DECODE_DPB_KHR,   vk::ImageUsageFlags::VIDEO_DECODE_DPB_KHR),
    (vk::FormatFeatureFlags2::VIDEO_ENCODE_DPB_KHR,   vk::ImageUsageFlags::VIDEO_ENCODE_DPB_KHR),
    (vk::FormatFeatureFlags2::VIDEO_ENCODE_INPUT_KHR, vk::ImageUsageFlags::VIDEO_ENCODE_SRC_KHR),
];

pub fn usage_from_features(feats: vk::FormatFeatureFlags2) -> vk::ImageUsageFlags {
    let mut usage = vk::ImageUsageFlags::empty();
    for &(f, u) in FEATURE_USAGE_MAP {
        if feats.contains(f) {
            usage |= u;
        }
    }
    usage
}

pub fn features_from_usage(usage: vk::ImageUsageFlags) -> vk::FormatFeatureFlags2 {
    let mut feats = vk::FormatFeatureFlags2::empty();
    for &(f, u) in FEATURE_USAGE_MAP {
        if usage.contains(u) {
            feats |= f;
        }
    }
    feats
}

/// Caller-side switches for [`resolve_with`].
///
/// `disable_multiplane` forces the per-plane fallback even when the combined
/// format is supported. `need_storage` rejects representations where neither
/// the ideal nor the fallback formats can back a storage image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    pub disable_multiplane: bool,
    pub need_storage: bool,
}

/// Outcome of format resolution: the concrete images a frame will be built
/// from, and the usage the device can support on them.
#[derive(Clone, Debug)]
pub struct FormatPlan {
    pub format: PixelFormat,
    pub tiling: vk::ImageTiling,
    /// One native format per image. Length 1 for a combined multiplanar
    /// representation.
    pub images: &'static [vk::Format],
    pub aspect: vk::ImageAspectFlags,
    pub supported_usage: vk::ImageUsageFlags,
}

impl FormatPlan {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }
}

/// Picks the representation for `entry` under the features `query` reports.
///
/// `query` must return the feature flags of a native format under the tiling
/// mode being resolved for. The ideal representation wins when it carries the
/// basic feature set and multiplane use is permitted; otherwise the per-plane
/// fallback is evaluated under the same rules. When the ideal format equals
/// its first fallback a single query answers for both.
pub fn resolve_with(
    entry: &'static FormatEntry,
    tiling: vk::ImageTiling,
    flags: ResolveFlags,
    mut query: impl FnMut(vk::Format) -> vk::FormatFeatureFlags2,
) -> Result<FormatPlan> {
    let feats_primary = query(entry.ideal);
    let basics_primary = feats_primary.contains(BASIC_FEATURES);
    let storage_primary = feats_primary.contains(vk::FormatFeatureFlags2::STORAGE_IMAGE);

    let (feats_secondary, basics_secondary, storage_secondary) = if entry.ideal != entry.fallback[0]
    {
        let f = query(entry.fallback[0]);
        (
            f,
            f.contains(BASIC_FEATURES),
            f.contains(vk::FormatFeatureFlags2::STORAGE_IMAGE),
        )
    } else {
        (feats_primary, basics_primary, storage_primary)
    };

    let storage_from_either = storage_primary || storage_secondary;

    if entry.image_count == 1
        && basics_primary
        && !(flags.disable_multiplane && entry.plane_count > 1)
        && (!flags.need_storage || storage_from_either)
    {
        let mut usage = usage_from_features(feats_primary);
        if flags.need_storage && storage_from_either {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        Ok(FormatPlan {
            format: entry.format,
            tiling,
            images: core::slice::from_ref(&entry.ideal),
            aspect: entry.aspect,
            supported_usage: usage,
        })
    } else if basics_secondary && (!flags.need_storage || storage_secondary) {
        Ok(FormatPlan {
            format: entry.format,
            tiling,
            images: entry.fallback,
            aspect: entry.aspect,
            supported_usage: usage_from_features(feats_secondary),
        })
    } else {
        Err(Error::Unsupported(format!(
            "no usable representation for {:?} under {tiling:?} tiling",
            entry.format
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{lookup, ASPECT_3PLANE, FORMAT_TABLE};

    fn basic_everywhere(_: vk::Format) -> vk::FormatFeatureFlags2 {
        BASIC_FEATURES
    }

    #[test]
    fn mapping_directions_agree() {
        for &(f, u) in FEATURE_USAGE_MAP {
            assert_eq!(usage_from_features(f), u);
            assert_eq!(features_from_usage(u), f);
        }
        let all_feats = FEATURE_USAGE_MAP
            .iter()
            .fold(vk::FormatFeatureFlags2::empty(), |acc, &(f, _)| acc | f);
        let all_usage = FEATURE_USAGE_MAP
            .iter()
            .fold(vk::ImageUsageFlags::empty(), |acc, &(_, u)| acc | u);
        assert_eq!(usage_from_features(all_feats), all_usage);
        assert_eq!(features_from_usage(all_usage), all_feats);
    }

    #[test]
    fn unmapped_bits_are_dropped() {
        let feats = vk::FormatFeatureFlags2::SAMPLED_IMAGE | vk::FormatFeatureFlags2::BLIT_SRC;
        assert_eq!(usage_from_features(feats), vk::ImageUsageFlags::SAMPLED);
    }

    #[test]
    fn combined_multiplanar_wins_when_supported() {
        let entry = lookup(PixelFormat::Yuv420p).unwrap();
        let plan = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags::default(),
            basic_everywhere,
        )
        .unwrap();
        assert_eq!(plan.image_count(), 1);
        assert_eq!(plan.images, &[vk::Format::G8_B8_R8_3PLANE_420_UNORM]);
        assert_eq!(plan.aspect, ASPECT_3PLANE);
        assert!(plan
            .supported_usage
            .contains(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_SRC));
    }

    #[test]
    fn disabling_multiplane_splits_planes() {
        let entry = lookup(PixelFormat::Yuv420p).unwrap();
        let plan = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags {
                disable_multiplane: true,
                ..Default::default()
            },
            basic_everywhere,
        )
        .unwrap();
        assert_eq!(plan.image_count(), 3);
        assert!(plan.images.iter().all(|&f| f == vk::Format::R8_UNORM));
    }

    #[test]
    fn unsupported_ideal_falls_back() {
        let entry = lookup(PixelFormat::Nv12).unwrap();
        let plan = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags::default(),
            |f| {
                if f == vk::Format::G8_B8R8_2PLANE_420_UNORM {
                    vk::FormatFeatureFlags2::empty()
                } else {
                    BASIC_FEATURES
                }
            },
        )
        .unwrap();
        assert_eq!(plan.images, &[vk::Format::R8_UNORM, vk::Format::R8G8_UNORM]);
    }

    #[test]
    fn storage_may_come_from_fallback() {
        // The combined format lacks storage but the per-plane formats have it;
        // the combined representation still wins and advertises storage.
        let entry = lookup(PixelFormat::Nv12).unwrap();
        let plan = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags {
                need_storage: true,
                ..Default::default()
            },
            |f| {
                if f == vk::Format::G8_B8R8_2PLANE_420_UNORM {
                    BASIC_FEATURES
                } else {
                    BASIC_FEATURES | vk::FormatFeatureFlags2::STORAGE_IMAGE
                }
            },
        )
        .unwrap();
        assert_eq!(plan.image_count(), 1);
        assert!(plan.supported_usage.contains(vk::ImageUsageFlags::STORAGE));
    }

    #[test]
    fn storage_requirement_can_reject() {
        let entry = lookup(PixelFormat::Nv12).unwrap();
        let err = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags {
                need_storage: true,
                ..Default::default()
            },
            basic_everywhere,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn nothing_supported_is_an_error() {
        let entry = lookup(PixelFormat::Yuv444p16).unwrap();
        let err = resolve_with(
            entry,
            vk::ImageTiling::LINEAR,
            ResolveFlags::default(),
            |_| vk::FormatFeatureFlags2::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn shared_ideal_and_fallback_query_once() {
        let entry = lookup(PixelFormat::Gray8).unwrap();
        let mut calls = 0;
        resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags::default(),
            |_| {
                calls += 1;
                BASIC_FEATURES
            },
        )
        .unwrap();
        assert_eq!(calls, 1);

        let entry = lookup(PixelFormat::Nv12).unwrap();
        let mut calls = 0;
        resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags::default(),
            |_| {
                calls += 1;
                BASIC_FEATURES
            },
        )
        .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn planar_rgb_always_resolves_per_plane() {
        let entry = lookup(PixelFormat::Gbrap).unwrap();
        let plan = resolve_with(
            entry,
            vk::ImageTiling::OPTIMAL,
            ResolveFlags::default(),
            basic_everywhere,
        )
        .unwrap();
        assert_eq!(plan.image_count(), 4);
        assert!(plan.images.iter().all(|&f| f == vk::Format::R8_UNORM));
    }

    #[test]
    fn resolved_image_count_is_one_or_fallback() {
        for entry in FORMAT_TABLE {
            let plan = resolve_with(
                entry,
                vk::ImageTiling::OPTIMAL,
                ResolveFlags::default(),
                basic_everywhere,
            )
            .unwrap();
            let n = plan.image_count() as u32;
            assert!(
                n == 1 || n == entry.fallback_count,
                "{:?} resolved to {} images",
                entry.format,
                n
            );
        }
    }
}
