//! Pulsar frame pipeline bench
//!
//! Builds a small graph on the headless driver: a transfer node on the
//! transfer family uploads vertex data every frame, a draw node on the
//! graphics family consumes it, and a post node follows the draw. Vertex
//! buffers are reallocated each frame so the deferred-free ring and the page
//! allocator see steady churn.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p pulsar-bench -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod args;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use ash::vk;
use parking_lot::Mutex;
use pulsar_core::EngineConfig;
use pulsar_gpu::{BufferDesc, HeadlessDriver, ImageDesc};
use pulsar_graph::{full_subresource_range, CallbackNode, FrameGraph, NodeDesc, TransferNode};
use pulsar_memory::{BufferAllocator, ImageAllocator, MemoryManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args::{print_help, BenchArgs};

const GRAPHICS_FAMILY: u32 = 0;
const TRANSFER_FAMILY: u32 = 1;
const VERTEX_COUNT: usize = 1024;
const TEXTURE_SIZE: u32 = 64;

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = BenchArgs::from_args();
    let config = EngineConfig::default()
        .with_frames_in_flight(args.frames_in_flight)
        .with_memory_page_size(args.page_size)
        .with_staging_size(args.staging_size);
    config.validate()?;
    info!(?args, "Pulsar frame pipeline bench");

    let driver = Arc::new(HeadlessDriver::new());
    let memory = Arc::new(Mutex::new(MemoryManager::from_config(driver.clone(), &config)));
    let buffers = BufferAllocator::new(driver.clone(), Arc::clone(&memory), config.frames_in_flight);
    let images = ImageAllocator::new(driver.clone(), Arc::clone(&memory), config.frames_in_flight);

    let mut graph = FrameGraph::new(driver.clone(), &config)?;
    let upload = TransferNode::register(&mut graph, "upload", driver.queue(TRANSFER_FAMILY), &buffers, &config)?;
    let draw = graph.add_node(
        NodeDesc::new(
            "draw",
            driver.queue(GRAPHICS_FAMILY),
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        CallbackNode::empty(),
    )?;
    let post = graph.add_node(
        NodeDesc::new(
            "post",
            driver.queue(GRAPHICS_FAMILY),
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        CallbackNode::empty(),
    )?;
    graph.add_edge(upload, draw)?;
    graph.add_edge(draw, post)?;

    let vertex_read = graph.add_buffer_usage(
        draw,
        vk::PipelineStageFlags::VERTEX_INPUT,
        vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
    )?;
    let texture_read = graph.add_image_usage(
        draw,
        vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    )?;

    {
        let buffers = buffers.clone();
        let images = images.clone();
        graph.on_frame_count_changed(move |frame_count| {
            buffers.set_frame_count(frame_count);
            images.set_frame_count(frame_count);
        });
    }
    graph.bake()?;

    let texture = images.allocate(
        &ImageDesc::new_2d(
            vk::Format::R8G8B8A8_UNORM,
            TEXTURE_SIZE,
            TEXTURE_SIZE,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        ),
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        vk::MemoryPropertyFlags::empty(),
    )?;
    let texture_range = full_subresource_range(texture.desc());
    let texels = vec![0x80u8; (TEXTURE_SIZE * TEXTURE_SIZE * 4) as usize];
    let texture_region = vk::BufferImageCopy {
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        },
        image_extent: vk::Extent3D {
            width: TEXTURE_SIZE,
            height: TEXTURE_SIZE,
            depth: 1,
        },
        ..Default::default()
    };

    let vertex_bytes = (VERTEX_COUNT * 3 * std::mem::size_of::<f32>()) as u64;
    let start = Instant::now();
    for frame in 0..args.frames {
        if frame == args.frames / 2 {
            if let Some(frame_count) = args.resize_to {
                graph.set_frame_count(frame_count)?;
                info!(frame, frame_count, "Frames in flight changed");
            }
        }

        let vertices = buffers.allocate(
            &BufferDesc::new(
                vertex_bytes,
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
            ),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::empty(),
        )?;
        let data: Vec<f32> = (0..VERTEX_COUNT * 3)
            .map(|i| (i as f32).mul_add(0.5, frame as f32))
            .collect();

        let transfer = graph.node_mut(upload).context("transfer node missing")?;
        transfer.transfer_slice(&data, &vertices, 0)?;
        if frame == 0 {
            transfer.transfer_image(
                &texels,
                &texture,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                texture_region,
            )?;
        }
        graph.declare_buffer(vertex_read, vertices.handle(), 0, vertex_bytes)?;
        graph.declare_image(texture_read, texture.handle(), texture_range)?;
        graph.submit()?;
        // Last read by the frame just submitted.
        buffers.free(vertices, graph.frame());

        let stamp = graph.stamp();
        buffers.update(stamp);
        images.update(stamp);
    }
    graph.wait()?;
    let elapsed = start.elapsed();

    let memory = memory.lock();
    info!(
        frames = args.frames,
        submissions = driver.submission_count(),
        completed = graph.completed_frames(),
        frames_in_flight = graph.frame_count(),
        pages = memory.total_page_count(),
        used_bytes = memory.used_bytes(),
        pending_buffers = buffers.pending_count(),
        device_allocations = driver.memory_allocations(),
        ?elapsed,
        "Bench finished"
    );
    drop(memory);

    drop(texture);
    drop(graph);
    buffers.flush();
    images.flush();
    Ok(())
}
