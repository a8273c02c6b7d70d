//! Resolution policy: which members are permitted to create a message.

use crate::error::PolicyMismatch;

/// A concrete resolution, usable standalone or as a variant inside
/// [`Resolution::Dynamic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionVariant {
    /// Any member may create the message.
    Public,
    /// Creation requires an explicit permit grant in the timeline.
    Linear,
}

/// Resolution meta.
#[derive(Clone, Debug)]
pub enum Resolution {
    Public,
    Linear,
    /// The effective policy varies with the message's global time: the last
    /// dynamic-settings event at or before that time selects the variant,
    /// defaulting to the first.
    Dynamic { variants: Vec<ResolutionVariant> },
}

impl Resolution {
    /// Dynamic resolution over an ordered variant list.
    pub fn dynamic(variants: Vec<ResolutionVariant>) -> Result<Self, PolicyMismatch> {
        if variants.len() < 2 {
            return Err(PolicyMismatch::new(
                "dynamic resolution needs at least two variants",
            ));
        }
        if variants.len() > u8::MAX as usize {
            return Err(PolicyMismatch::new("too many dynamic resolution variants"));
        }
        Ok(Resolution::Dynamic { variants })
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Resolution::Dynamic { .. })
    }

    pub fn variants(&self) -> &[ResolutionVariant] {
        match self {
            Resolution::Dynamic { variants } => variants,
            _ => &[],
        }
    }
}

/// Per-message resolution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolutionImpl {
    Public,
    Linear,
    /// The wire carries the single byte `index` into the meta's variant
    /// list; `variant` is the resolved copy.
    Dynamic {
        index: u8,
        variant: ResolutionVariant,
    },
}

impl ResolutionImpl {
    /// Build the dynamic implementation for `index`, validating membership
    /// in the declared set.
    pub fn dynamic(meta: &Resolution, index: u8) -> Result<Self, PolicyMismatch> {
        let variants = meta.variants();
        match variants.get(index as usize) {
            Some(variant) => Ok(ResolutionImpl::Dynamic {
                index,
                variant: *variant,
            }),
            None => Err(PolicyMismatch::new(format!(
                "dynamic resolution index {} out of range ({} variants)",
                index,
                variants.len()
            ))),
        }
    }

    /// The concrete policy governing this message.
    pub fn variant(&self) -> ResolutionVariant {
        match self {
            ResolutionImpl::Public => ResolutionVariant::Public,
            ResolutionImpl::Linear => ResolutionVariant::Linear,
            ResolutionImpl::Dynamic { variant, .. } => *variant,
        }
    }

    pub fn index(&self) -> Option<u8> {
        match self {
            ResolutionImpl::Dynamic { index, .. } => Some(*index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_requires_two_variants() {
        assert!(Resolution::dynamic(vec![ResolutionVariant::Public]).is_err());
        assert!(
            Resolution::dynamic(vec![ResolutionVariant::Public, ResolutionVariant::Linear])
                .is_ok()
        );
    }

    #[test]
    fn test_dynamic_index_bounds() {
        let meta =
            Resolution::dynamic(vec![ResolutionVariant::Public, ResolutionVariant::Linear])
                .unwrap();
        assert_eq!(
            ResolutionImpl::dynamic(&meta, 1).unwrap().variant(),
            ResolutionVariant::Linear
        );
        assert!(ResolutionImpl::dynamic(&meta, 2).is_err());
    }
}
