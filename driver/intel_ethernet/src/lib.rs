//! Descriptor formats for Intel ethernet controllers.
//!
//! The 82599 family consumes "advanced" 16-byte descriptors in one-buffer
//! mode. A descriptor has two lives: in *read* format the driver fills in
//! physical addresses, in *write-back* format the hardware overwrites the
//! same 16 bytes with status, length and offload results. The accessors here
//! decode both without ever copying a descriptor out of ring memory.

pub mod descriptors;

pub use descriptors::{
    AdvancedRxDescriptor, AdvancedTxDescriptor, RxDescriptor, TxDescriptor,
};
