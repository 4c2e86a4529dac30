#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::inline_always,
    clippy::many_single_char_names,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::unreadable_literal,
    clippy::wildcard_imports
)]

//! N-dimensional bounding volume hierarchy over axis-aligned bounding boxes.
//!
//! The tree is built in parallel over opaque primitives (anything with an
//! `aabb_of` function), then queried through overlap search, dual-tree and
//! self search, ordered ray casting, and best-only/k-nearest nearness
//! search. A [`ModTree`] absorbs element churn without full rebuilds, and a
//! [`Form`] binds any tree to a [`Frame`] so queries run against moving
//! geometry without copying it.

use log::debug;
use nalgebra as na;

mod aabb;
mod executor;
mod form;
mod math;
mod metric;
mod nearness;
mod range;
mod ray;
mod ray_cast;
mod search;
mod select;
mod transform;
mod tree;

pub use aabb::*;
pub use executor::*;
pub use form::*;
pub use math::*;
pub use metric::*;
pub use nearness::*;
pub use range::*;
pub use ray::*;
pub use ray_cast::*;
pub use search::*;
pub use select::*;
pub use transform::*;
pub use tree::*;
