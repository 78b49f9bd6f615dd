//! Triple buffered frame pacing.
//!
//! Each of the [FRAMES_IN_FLIGHT] slots owns a fence, a command pool and the primary command buffer the frame graph
//! is executed from. A slot is only reused once its fence signaled, which is also the point at which everything
//! reclaimed for that slot can be destroyed.

use crate::{
    FRAMES_IN_FLIGHT,
    backend::{Backend, CommandLevel, SurfaceImage},
};

struct FrameSlot<B: Backend> {
    fence: B::Fence,
    pool: B::CommandPool,
    primary: B::CommandBuffer,
    ///True while a submission on this slot was not yet waited for.
    in_flight: bool,
}

pub struct FramePacer<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    index: usize,
    frame: u64,
}

impl<B: Backend> FramePacer<B> {
    pub(crate) fn new(backend: &B) -> Result<Self, B::Error> {
        let mut slots: Vec<FrameSlot<B>> = Vec::with_capacity(FRAMES_IN_FLIGHT);
        for _ in 0..FRAMES_IN_FLIGHT {
            match Self::create_slot(backend) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        backend.destroy_command_pool(slot.pool);
                        backend.destroy_fence(slot.fence);
                    }
                    return Err(e);
                }
            }
        }
        Ok(FramePacer {
            slots,
            index: 0,
            frame: 0,
        })
    }

    fn create_slot(backend: &B) -> Result<FrameSlot<B>, B::Error> {
        let mut pool = backend.create_command_pool()?;
        let primary = match backend.allocate_command_buffer(&mut pool, CommandLevel::Primary) {
            Ok(cb) => cb,
            Err(e) => {
                backend.destroy_command_pool(pool);
                return Err(e);
            }
        };
        let fence = match backend.create_fence(true) {
            Ok(f) => f,
            Err(e) => {
                backend.destroy_command_pool(pool);
                return Err(e);
            }
        };
        Ok(FrameSlot {
            fence,
            pool,
            primary,
            in_flight: false,
        })
    }

    ///Index of the active frame slot.
    pub fn slot(&self) -> usize {
        self.index
    }

    ///Number of frames submitted so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    ///Blocks until the active slot's last submission finished.
    pub(crate) fn wait(&mut self, backend: &B, timeout: u64) -> Result<(), B::Error> {
        let slot = &mut self.slots[self.index];
        if slot.in_flight {
            backend.wait_fence(&slot.fence, timeout)?;
            slot.in_flight = false;
        }
        Ok(())
    }

    pub(crate) fn wait_all(&mut self, backend: &B, timeout: u64) -> Result<(), B::Error> {
        for slot in self.slots.iter_mut() {
            if slot.in_flight {
                backend.wait_fence(&slot.fence, timeout)?;
                slot.in_flight = false;
            }
        }
        Ok(())
    }

    ///Resets the active slot's pool and begins its primary command buffer.
    pub(crate) fn begin(&mut self, backend: &B) -> Result<(), B::Error> {
        let slot = &mut self.slots[self.index];
        backend.reset_command_pool(&mut slot.pool)?;
        backend.begin(&mut slot.primary)
    }

    pub(crate) fn primary_mut(&mut self) -> &mut B::CommandBuffer {
        &mut self.slots[self.index].primary
    }

    pub(crate) fn end(&mut self, backend: &B) -> Result<(), B::Error> {
        backend.end(&mut self.slots[self.index].primary)
    }

    pub(crate) fn submit(
        &mut self,
        backend: &B,
        surface: Option<&SurfaceImage>,
    ) -> Result<(), B::Error> {
        let index = self.index;
        let slot = &mut self.slots[index];
        backend.reset_fence(&slot.fence)?;
        backend.submit(index, &slot.primary, &slot.fence, surface)?;
        slot.in_flight = true;
        Ok(())
    }

    ///Moves on to the next slot.
    pub(crate) fn advance(&mut self) {
        self.index = (self.index + 1) % FRAMES_IN_FLIGHT;
        self.frame += 1;
    }

    ///Destroys all native objects. Only valid once the device is idle.
    pub(crate) fn destroy(&mut self, backend: &B) {
        for slot in self.slots.drain(..) {
            backend.destroy_command_pool(slot.pool);
            backend.destroy_fence(slot.fence);
        }
    }
}
