use ash::vk;
use std::{fmt::Debug, ops::Deref};

/// Queue sharing mode for created images and buffers.
#[derive(Debug, Clone)]
pub enum SharingMode<T>
where
    T: Deref<Target = [u32]>,
{
    Exclusive,
    Concurrent { queue_family_indices: T },
}

impl<T: Deref<Target = [u32]>> SharingMode<T> {
    pub fn as_raw(&self) -> vk::SharingMode {
        match self {
            Self::Exclusive => vk::SharingMode::EXCLUSIVE,
            Self::Concurrent { .. } => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn queue_family_indices(&self) -> &[u32] {
        match self {
            Self::Exclusive => &[],
            Self::Concurrent {
                queue_family_indices,
            } => queue_family_indices.deref(),
        }
    }
}

pub trait AsVkHandle {
    type Handle: ash::vk::Handle + Copy;
    fn vk_handle(&self) -> Self::Handle;
}
impl<T> AsVkHandle for &'_ T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}
impl<T> AsVkHandle for &'_ mut T
where
    T: AsVkHandle,
{
    type Handle = T::Handle;

    fn vk_handle(&self) -> Self::Handle {
        T::vk_handle(self)
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// An `alignment` of zero is treated as no alignment requirement.
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);
impl Version {
    pub const V1_0: Self = Self::new(0, 1, 0, 0);
    pub const V1_1: Self = Self::new(0, 1, 1, 0);
    pub const V1_2: Self = Self::new(0, 1, 2, 0);
    pub const V1_3: Self = Self::new(0, 1, 3, 0);

    pub const fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        let num = vk::make_api_version(variant, major, minor, patch);
        Self(num)
    }
    pub const fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }
    pub const fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }
    pub const fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }
    pub const fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}
impl Default for Version {
    fn default() -> Self {
        Self::new(0, 0, 1, 0)
    }
}
impl Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "Version({}.{}.{})",
            self.major(),
            self.minor(),
            self.patch()
        ))?;
        let variant = self.variant();
        if variant != 0 {
            f.write_fmt(format_args!(" variant {variant}"))?;
        }
        Ok(())
    }
}
impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{}.{}.{}",
            self.major(),
            self.minor(),
            self.patch()
        ))?;
        let variant = self.variant();
        if variant != 0 {
            f.write_fmt(format_args!(" variant {variant}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(100, 0), 100);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::V1_3 > Version::V1_2);
        assert_eq!(Version::V1_2.minor(), 2);
    }
}
