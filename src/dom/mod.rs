//! In-memory page model the blocks act on.
//!
//! Regions stand in for DOM elements. Each carries the BEM marks, hide flag
//! and key/value modifiers its class list would have, plus any hidden form
//! fields. HTML fragments are opaque payloads; only their marked elements and
//! hidden inputs are lifted into regions.

mod core;
mod fragment;

pub use self::core::{Document, Region, RegionId, RegionSpec, SharedDocument, read, shared, write};
pub use fragment::{
    BemClasses, Fragment, FragmentElement, HiddenField, parse_class_list, strip_markup,
};
