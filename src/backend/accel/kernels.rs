//! Kernel dispatch
//!
//! Each call records one command buffer: bind the inputs, the output and a
//! uniform parameter block, dispatch, submit. The output buffer keeps the
//! submission index so readers wait for exactly that work.

use super::{Accel, GpuBuffer};
use crate::backend::{BinaryOp, UnaryOp, host};
use crate::error::Result;
use crate::shape::MatMulShape;
use log::trace;
use wgpu::util::DeviceExt;

const WORKGROUP: usize = 256;
const MAX_GROUPS: usize = 65_535;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct BinaryParams {
    op: u32,
    len: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct UnaryParams {
    op: u32,
    len: u32,
    p0: f32,
    p1: f32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct MatMulParams {
    m: u32,
    k: u32,
    n: u32,
    batch: u32,
}

const fn binary_code(op: BinaryOp) -> u32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Maximum => 4,
        BinaryOp::Gt => 5,
        BinaryOp::Lt => 6,
        BinaryOp::Eq => 7,
    }
}

/// Shader op code plus its two scalar parameters
const fn unary_code(op: UnaryOp) -> (u32, f32, f32) {
    match op {
        UnaryOp::Neg => (0, 0.0, 0.0),
        UnaryOp::Square => (1, 0.0, 0.0),
        UnaryOp::Sqrt => (2, 0.0, 0.0),
        UnaryOp::Pow(p) => (3, p, 0.0),
        UnaryOp::Exp => (4, 0.0, 0.0),
        UnaryOp::Log => (5, 0.0, 0.0),
        UnaryOp::Sin => (6, 0.0, 0.0),
        UnaryOp::Cos => (7, 0.0, 0.0),
        UnaryOp::Tanh => (8, 0.0, 0.0),
        UnaryOp::Sigmoid => (9, 0.0, 0.0),
        UnaryOp::Abs => (10, 0.0, 0.0),
        UnaryOp::Clip(lo, hi) => (11, lo, hi),
        UnaryOp::Scale(s) => (12, s, 0.0),
        UnaryOp::AddScalar(s) => (13, s, 0.0),
        UnaryOp::InRange(lo, hi) => (14, lo, hi),
    }
}

/// 1-D launch folded into two grid axes
fn linear_groups(len: usize) -> (u32, u32, u32) {
    let groups = len.div_ceil(WORKGROUP).max(1);
    let x = groups.min(MAX_GROUPS);
    (x as u32, groups.div_ceil(MAX_GROUPS) as u32, 1)
}

fn binding(buffer: &GpuBuffer) -> wgpu::BindingResource<'_> {
    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
        buffer: buffer.raw(),
        offset: 0,
        size: wgpu::BufferSize::new(buffer.byte_len()),
    })
}

impl Accel {
    fn uniform<P: bytemuck::Pod>(&self, label: &str, params: &P) -> wgpu::Buffer {
        self.gpu
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(params),
                usage: wgpu::BufferUsages::UNIFORM,
            })
    }

    /// Bind `resources` in order, dispatch and submit; the output waits on it
    fn launch(
        &self,
        label: &str,
        pipeline: &wgpu::ComputePipeline,
        resources: Vec<wgpu::BindingResource<'_>>,
        groups: (u32, u32, u32),
        out: &GpuBuffer,
    ) {
        let device = self.gpu.device();
        let layout = pipeline.get_bind_group_layout(0);
        let entries: Vec<wgpu::BindGroupEntry<'_>> = resources
            .into_iter()
            .enumerate()
            .map(|(i, resource)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource,
            })
            .collect();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(label),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(label),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0, groups.1, groups.2);
        }
        let index = self.gpu.queue().submit(Some(encoder.finish()));
        trace!("{label}: dispatched {groups:?}");
        out.set_pending(index);
    }

    pub(super) fn binary_kernel(
        &self,
        op: BinaryOp,
        a: &GpuBuffer,
        b: &GpuBuffer,
    ) -> Result<GpuBuffer> {
        let len = a.len();
        let out = self.allocate(len)?;
        let params = self.uniform(
            "binary params",
            &BinaryParams {
                op: binary_code(op),
                len: len as u32,
                _pad: [0; 2],
            },
        );
        self.launch(
            "binary",
            &self.gpu.pipelines().binary,
            vec![
                binding(a),
                binding(b),
                binding(&out),
                params.as_entire_binding(),
            ],
            linear_groups(len),
            &out,
        );
        Ok(out)
    }

    pub(super) fn unary_kernel(&self, op: UnaryOp, a: &GpuBuffer) -> Result<GpuBuffer> {
        let len = a.len();
        let out = self.allocate(len)?;
        let (code, p0, p1) = unary_code(op);
        let params = self.uniform(
            "unary params",
            &UnaryParams {
                op: code,
                len: len as u32,
                p0,
                p1,
            },
        );
        self.launch(
            "unary",
            &self.gpu.pipelines().unary,
            vec![binding(a), binding(&out), params.as_entire_binding()],
            linear_groups(len),
            &out,
        );
        Ok(out)
    }

    /// Whether a product fits a single dispatch
    pub(super) fn matmul_fits(mm: &MatMulShape) -> bool {
        mm.m.div_ceil(16) <= MAX_GROUPS
            && mm.n.div_ceil(16) <= MAX_GROUPS
            && mm.batch_size() <= MAX_GROUPS
    }

    pub(super) fn matmul_kernel(
        &self,
        a: &GpuBuffer,
        b: &GpuBuffer,
        mm: &MatMulShape,
    ) -> Result<GpuBuffer> {
        let (m, k, n) = (mm.m, mm.k, mm.n);
        let batch = mm.batch_size();
        let left_batch = &mm.left[..mm.left.len() - 2];
        let right_batch = &mm.right[..mm.right.len() - 2];
        let offsets: Vec<u32> = (0..batch)
            .flat_map(|bi| {
                [
                    (host::batch_index(&mm.batch, left_batch, bi) * m * k) as u32,
                    (host::batch_index(&mm.batch, right_batch, bi) * k * n) as u32,
                ]
            })
            .collect();
        let offsets = self
            .gpu
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("matmul offsets"),
                contents: bytemuck::cast_slice(&offsets),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let out = self.allocate(batch * m * n)?;
        let params = self.uniform(
            "matmul params",
            &MatMulParams {
                m: m as u32,
                k: k as u32,
                n: n as u32,
                batch: batch as u32,
            },
        );
        self.launch(
            "matmul",
            &self.gpu.pipelines().matmul,
            vec![
                binding(a),
                binding(b),
                binding(&out),
                params.as_entire_binding(),
                offsets.as_entire_binding(),
            ],
            (
                n.div_ceil(16) as u32,
                m.div_ceil(16) as u32,
                batch as u32,
            ),
            &out,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_launches_fold_into_a_second_axis() {
        assert_eq!(linear_groups(1), (1, 1, 1));
        assert_eq!(linear_groups(256 * 10), (10, 1, 1));
        let (x, y, _) = linear_groups(256 * MAX_GROUPS + 1);
        assert_eq!((x as usize, y), (MAX_GROUPS, 2));
    }

    #[test]
    fn every_unary_op_has_a_distinct_code() {
        let ops = [
            UnaryOp::Neg,
            UnaryOp::Square,
            UnaryOp::Sqrt,
            UnaryOp::Pow(2.0),
            UnaryOp::Exp,
            UnaryOp::Log,
            UnaryOp::Sin,
            UnaryOp::Cos,
            UnaryOp::Tanh,
            UnaryOp::Sigmoid,
            UnaryOp::Abs,
            UnaryOp::Clip(0.0, 1.0),
            UnaryOp::Scale(2.0),
            UnaryOp::AddScalar(1.0),
            UnaryOp::InRange(0.0, 1.0),
        ];
        let mut codes: Vec<u32> = ops.iter().map(|&op| unary_code(op).0).collect();
        codes.dedup();
        assert_eq!(codes, (0..15).collect::<Vec<_>>());
    }
}
