use ash::vk;
use kiln::sync_state::Barrier;
use tinyvec::TinyVec;

///Collects the barriers of one [NativeCommand::Barriers](kiln::backend::NativeCommand::Barriers) batch and
/// records them as a single `vkCmdPipelineBarrier2`.
///
/// Uses tinyvec internally, so small batches never touch the heap.
#[derive(Debug, Default)]
pub struct BarrierBuilder {
    pub images: TinyVec<[vk::ImageMemoryBarrier2<'static>; Self::STACK_ALLOCATION]>,
    pub buffers: TinyVec<[vk::BufferMemoryBarrier2<'static>; Self::STACK_ALLOCATION]>,
}

impl BarrierBuilder {
    ///Ammount of barriers per type that are stack allocated.
    pub const STACK_ALLOCATION: usize = 6;

    pub fn new() -> Self {
        Self::default()
    }

    ///Whole-buffer barrier.
    pub fn buffer(&mut self, buffer: vk::Buffer, barrier: &Barrier) -> &mut Self {
        let item = vk::BufferMemoryBarrier2::default()
            .buffer(buffer)
            .src_access_mask(barrier.src.access)
            .src_stage_mask(barrier.src.stage)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_access_mask(barrier.dst.access)
            .dst_stage_mask(barrier.dst.stage)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .offset(0)
            .size(vk::WHOLE_SIZE);
        self.buffers.push(item);
        self
    }

    ///Barrier over all mips and layers of `image`.
    pub fn image(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        barrier: &Barrier,
    ) -> &mut Self {
        self.image_raw(
            image,
            aspect,
            (barrier.src.stage, barrier.src.access, barrier.old_layout()),
            (barrier.dst.stage, barrier.dst.access, barrier.new_layout()),
        )
    }

    ///Image barrier from explicit `(stage, access, layout)` pairs. Used for the surface images, which are not
    /// tracked by kiln.
    pub fn image_raw(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        src: (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout),
        dst: (vk::PipelineStageFlags2, vk::AccessFlags2, vk::ImageLayout),
    ) -> &mut Self {
        let item = vk::ImageMemoryBarrier2::default()
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(aspect)
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(vk::REMAINING_ARRAY_LAYERS),
            )
            .src_stage_mask(src.0)
            .src_access_mask(src.1)
            .old_layout(src.2)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_stage_mask(dst.0)
            .dst_access_mask(dst.1)
            .new_layout(dst.2)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);

        #[cfg(feature = "logging")]
        log::trace!("image barrier[{:?}] {:?} -> {:?}", image, src.2, dst.2);

        self.images.push(item);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.buffers.is_empty()
    }

    ///Records all collected barriers. Does nothing if no barrier was added.
    pub fn record(&self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        if self.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .image_memory_barriers(self.images.as_slice())
            .buffer_memory_barriers(self.buffers.as_slice());
        unsafe { device.cmd_pipeline_barrier2(command_buffer, &dependency) };
    }
}

#[cfg(test)]
mod tests {
    use kiln::{
        ResourceKind,
        sync_state::{KernelKind, SyncState, UsageKind, transition},
    };

    use super::*;

    #[test]
    fn layout_transition_lands_in_image_barrier() {
        let barrier = transition(
            ResourceKind::Texture,
            SyncState::new(KernelKind::Graphics, UsageKind::RenderTarget),
            SyncState::new(KernelKind::Compute, UsageKind::ReadTexture),
        )
        .expect("valid transition")
        .expect("distinct states need a barrier");

        let mut builder = BarrierBuilder::new();
        builder.image(vk::Image::null(), vk::ImageAspectFlags::COLOR, &barrier);
        assert_eq!(builder.images.len(), 1);
        assert!(builder.buffers.is_empty());
        assert_eq!(
            builder.images[0].old_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(builder.images[0].new_layout, barrier.new_layout());
        assert_eq!(
            builder.images[0].src_stage_mask,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT
        );
    }

    #[test]
    fn outgrows_stack_allocation() {
        let barrier = transition(
            ResourceKind::Buffer,
            SyncState::new(KernelKind::Transfer, UsageKind::TransferDst),
            SyncState::new(KernelKind::Compute, UsageKind::ReadBuffer),
        )
        .expect("valid transition")
        .expect("distinct states need a barrier");

        let mut builder = BarrierBuilder::new();
        for _ in 0..(BarrierBuilder::STACK_ALLOCATION * 2) {
            builder.buffer(vk::Buffer::null(), &barrier);
        }
        assert_eq!(builder.buffers.len(), BarrierBuilder::STACK_ALLOCATION * 2);
        assert!(builder.buffers.iter().all(|b| b.size == vk::WHOLE_SIZE));
    }
}
