//! Transfer buffer pool.
//!
//! Owns the transport descriptors and their backing buffers for one streaming
//! session. Submission and cancellation policy live in the stream module.

use crate::format::TransferKind;
use crate::transport::{Transport, TransferStatus};

/// One pool slot: transport descriptor, backing memory and last known status.
pub struct TransferDescriptor<X> {
    pub transfer: X,
    pub buffer: Box<[u8]>,
    pub status: TransferStatus,
}

impl<X> TransferDescriptor<X> {
    /// Submitted and not yet reported back by the transport.
    pub fn is_pending(&self) -> bool {
        self.status == TransferStatus::Pending
    }
}

/// Fixed-count set of transfers for one transfer kind.
pub struct TransferPool<X> {
    slots: Vec<Option<TransferDescriptor<X>>>,
    kind: TransferKind,
}

impl<X> Default for TransferPool<X> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            kind: TransferKind::default(),
        }
    }
}

impl<X> TransferPool<X> {
    pub fn is_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Number of slots, allocated or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    /// Allocate `count` transfers of `kind`. A no-op if already allocated.
    ///
    /// On error the pool is left partially allocated; [`TransferPool::free`]
    /// releases whatever was obtained.
    pub fn allocate<T>(&mut self, transport: &mut T, kind: TransferKind, count: usize) -> rusb::Result<()>
    where
        T: Transport<Transfer = X>,
    {
        if self.is_allocated() {
            return Ok(());
        }

        self.kind = kind;
        self.slots = (0..count).map(|_| None).collect();

        for slot in 0..count {
            let transfer = transport.alloc_transfer(slot, kind)?;
            self.slots[slot] = Some(TransferDescriptor {
                transfer,
                buffer: vec![0u8; kind.buffer_len()].into_boxed_slice(),
                status: TransferStatus::Idle,
            });
        }

        tracing::debug!("Allocated {} {:?} transfers", count, kind);
        Ok(())
    }

    /// Release every descriptor and buffer, skipping empty slots.
    ///
    /// Transfers still in flight are leaked rather than freed, so the
    /// transport can never write into released memory.
    pub fn free<T>(&mut self, transport: &mut T)
    where
        T: Transport<Transfer = X>,
    {
        let mut leaked = 0;
        for descriptor in self.slots.drain(..).flatten() {
            if descriptor.is_pending() {
                leaked += 1;
                std::mem::forget(descriptor.transfer);
                let _ = Box::leak(descriptor.buffer);
            } else {
                transport.free_transfer(descriptor.transfer);
            }
        }

        if leaked > 0 {
            tracing::warn!("Leaked {} transfers still in flight", leaked);
        }
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut TransferDescriptor<X>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TransferDescriptor<X>> {
        self.slots.iter_mut().flatten()
    }

    /// Transfers submitted and not yet reported back.
    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().filter(|d| d.is_pending()).count()
    }
}
