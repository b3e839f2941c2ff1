//! # GPU synchronization primitives
//!
//! | Type | Role |
//! |------|------|
//! | [`Fence`] | One-shot completion signal with an optional error and a lazy enable-signaling hook. |
//! | [`FenceArray`] | "All of these" combinator; collapses into a single [`Fence`]. |
//! | [`Reservation`] | Per-object lock plus the fences of in-flight work on the object. |
//! | [`AcquireContext`] | Deadlock-free multi-[`Reservation`] acquisition in global id order. |
//!
//! Producers complete fences from any thread. Waits on fences are either
//! unbounded ([`Fence::wait`]) or bounded ([`Fence::wait_timeout`]); callers
//! decide which one applies to the work behind the fence.

mod acquire;
mod fence;
mod fence_array;
mod reservation;

pub use acquire::{AcquireContext, AcquireError};
pub use fence::{EnableSignaling, Fence, FenceCallback, FenceError};
pub use fence_array::FenceArray;
pub use reservation::{FenceUsage, Reservation};
