//! The service address space and the dispatcher that serves it.
//!
//! Every UEFI table and protocol the guest sees lives at a 64 KiB aligned
//! base in the service space. Its slots point into a poisoned trap half,
//! so any call through a slot stops the guest and lands in
//! [`Dispatcher::dispatch`].

pub mod dispatch;
pub mod handle;
pub mod space;

pub use dispatch::{
    Creator, Dispatched, Dispatcher, Registration, Request, Service, ServiceOptions,
};
pub use handle::HandleRegistry;
pub use space::{BumpAllocator, ServPtr, ServiceSpace};
