//! WGSL compute shaders for the Yee stencils and the Boris push.
//!
//! Every kernel indexes the shared field buffer through `at`, which maps a
//! component and a node (ghosts at negative indices) to a flat offset.

/// Threads per workgroup of every kernel.
pub const WORKGROUP_SIZE: u32 = 256;

/// Maximum workgroups along one dispatch dimension.
pub const MAX_GROUPS_X: u32 = 65535;

/// Declarations shared by all kernels.
const PRELUDE: &str = r#"
const EX: u32 = 0u;
const EY: u32 = 1u;
const EZ: u32 = 2u;
const HX: u32 = 3u;
const HY: u32 = 4u;
const HZ: u32 = 5u;
const JX: u32 = 6u;
const JY: u32 = 7u;
const JZ: u32 = 8u;

// Padded dims in xyz, samples per array in w.
struct Layout {
    padded: vec4<u32>,
    ghost: i32,
    count: u32,
    _pad0: u32,
    _pad1: u32,
}

fn flat(grid_layout: Layout, c: u32, i: i32, j: i32, k: i32) -> u32 {
    let g = grid_layout.ghost;
    let px = i32(grid_layout.padded.x);
    let py = i32(grid_layout.padded.y);
    return c * grid_layout.padded.w + u32((i + g) + px * ((j + g) + py * (k + g)));
}

fn thread_index(gid: vec3<u32>) -> u32 {
    return gid.x + gid.y * 16776960u;
}
"#;

/// `H -= coef * curl E` over a node range. `inv_h.w` holds `fraction * tau`.
const MAGNETIC_KERNEL: &str = r#"
struct StencilParams {
    grid_layout: Layout,
    start: vec4<i32>,
    extent: vec4<u32>,
    inv_h: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: StencilParams;
@group(0) @binding(1) var<storage, read_write> f: array<f32>;

fn at(c: u32, i: i32, j: i32, k: i32) -> u32 {
    return flat(params.grid_layout, c, i, j, k);
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let ext = params.extent.xyz;
    let n = thread_index(gid);
    if (n >= ext.x * ext.y * ext.z) {
        return;
    }
    let i = params.start.x + i32(n % ext.x);
    let j = params.start.y + i32((n / ext.x) % ext.y);
    let k = params.start.z + i32(n / (ext.x * ext.y));
    let ih = params.inv_h.xyz;
    let c = params.inv_h.w;

    let ex = f[at(EX, i, j, k)];
    let ey = f[at(EY, i, j, k)];
    let ez = f[at(EZ, i, j, k)];

    let curl_x = (f[at(EZ, i, j + 1, k)] - ez) * ih.y - (f[at(EY, i, j, k + 1)] - ey) * ih.z;
    let curl_y = (f[at(EX, i, j, k + 1)] - ex) * ih.z - (f[at(EZ, i + 1, j, k)] - ez) * ih.x;
    let curl_z = (f[at(EY, i + 1, j, k)] - ey) * ih.x - (f[at(EX, i, j + 1, k)] - ex) * ih.y;

    f[at(HX, i, j, k)] -= c * curl_x;
    f[at(HY, i, j, k)] -= c * curl_y;
    f[at(HZ, i, j, k)] -= c * curl_z;
}
"#;

/// `E += tau * (curl H - J)` over a node range. `inv_h.w` holds `tau`.
const ELECTRIC_KERNEL: &str = r#"
struct StencilParams {
    grid_layout: Layout,
    start: vec4<i32>,
    extent: vec4<u32>,
    inv_h: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: StencilParams;
@group(0) @binding(1) var<storage, read_write> f: array<f32>;

fn at(c: u32, i: i32, j: i32, k: i32) -> u32 {
    return flat(params.grid_layout, c, i, j, k);
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let ext = params.extent.xyz;
    let n = thread_index(gid);
    if (n >= ext.x * ext.y * ext.z) {
        return;
    }
    let i = params.start.x + i32(n % ext.x);
    let j = params.start.y + i32((n / ext.x) % ext.y);
    let k = params.start.z + i32(n / (ext.x * ext.y));
    let ih = params.inv_h.xyz;
    let t = params.inv_h.w;

    let hx = f[at(HX, i, j, k)];
    let hy = f[at(HY, i, j, k)];
    let hz = f[at(HZ, i, j, k)];

    let curl_x = (hz - f[at(HZ, i, j - 1, k)]) * ih.y - (hy - f[at(HY, i, j, k - 1)]) * ih.z;
    let curl_y = (hx - f[at(HX, i, j, k - 1)]) * ih.z - (hz - f[at(HZ, i - 1, j, k)]) * ih.x;
    let curl_z = (hy - f[at(HY, i - 1, j, k)]) * ih.x - (hx - f[at(HX, i, j - 1, k)]) * ih.y;

    f[at(EX, i, j, k)] += t * curl_x - t * f[at(JX, i, j, k)];
    f[at(EY, i, j, k)] += t * curl_y - t * f[at(JY, i, j, k)];
    f[at(EZ, i, j, k)] += t * curl_z - t * f[at(JZ, i, j, k)];
}
"#;

/// Relativistic Boris push with trilinear interpolation of E and H.
///
/// Writes increments rather than new state so the host can apply them to
/// its double-precision copy.
const PUSH_KERNEL: &str = r#"
struct PushParams {
    grid_layout: Layout,
    // xyz: 1/h, w: tau
    inv_h: vec4<f32>,
}

struct Particle {
    position: vec4<f32>,
    momentum: vec4<f32>,
}

struct Delta {
    dx: vec4<f32>,
    du: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: PushParams;
@group(0) @binding(1) var<storage, read> f: array<f32>;
@group(0) @binding(2) var<storage, read> particles: array<Particle>;
@group(0) @binding(3) var<storage, read_write> deltas: array<Delta>;

fn interpolate(c: u32, s: vec3<f32>, stagger: vec3<f32>) -> f32 {
    let t = s - stagger;
    let fl = floor(t);
    let w1 = t - fl;
    let w0 = vec3<f32>(1.0) - w1;
    let b = vec3<i32>(fl);
    var value = 0.0;
    for (var dz = 0; dz < 2; dz++) {
        let wz = select(w0.z, w1.z, dz == 1);
        for (var dy = 0; dy < 2; dy++) {
            let wy = select(w0.y, w1.y, dy == 1);
            for (var dx = 0; dx < 2; dx++) {
                let wx = select(w0.x, w1.x, dx == 1);
                value += wx * wy * wz * f[flat(params.grid_layout, c, b.x + dx, b.y + dy, b.z + dz)];
            }
        }
    }
    return value;
}

@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let idx = thread_index(gid);
    if (idx >= params.grid_layout.count) {
        return;
    }
    let p = particles[idx];
    let s = p.position.xyz * params.inv_h.xyz;
    let tau = params.inv_h.w;
    let q_m = p.momentum.w;

    let e = vec3<f32>(
        interpolate(EX, s, vec3<f32>(0.5, 0.0, 0.0)),
        interpolate(EY, s, vec3<f32>(0.0, 0.5, 0.0)),
        interpolate(EZ, s, vec3<f32>(0.0, 0.0, 0.5)),
    );
    let b = vec3<f32>(
        interpolate(HX, s, vec3<f32>(0.0, 0.5, 0.5)),
        interpolate(HY, s, vec3<f32>(0.5, 0.0, 0.5)),
        interpolate(HZ, s, vec3<f32>(0.5, 0.5, 0.0)),
    );

    let half = 0.5 * q_m * tau;
    let u = p.momentum.xyz;
    let u_minus = u + e * half;
    let gamma = sqrt(1.0 + dot(u_minus, u_minus));
    let t = b * (half / gamma);
    let u_prime = u_minus + cross(u_minus, t);
    let sv = t * (2.0 / (1.0 + dot(t, t)));
    let u_plus = u_minus + cross(u_prime, sv);
    let u_new = u_plus + e * half;
    let gamma_new = sqrt(1.0 + dot(u_new, u_new));

    deltas[idx] = Delta(
        vec4<f32>(u_new * (tau / gamma_new), 0.0),
        vec4<f32>(u_new - u, 0.0),
    );
}
"#;

/// Full source of one kernel.
pub fn kernel_source(kernel: Kernel) -> String {
    let body = match kernel {
        Kernel::Magnetic => MAGNETIC_KERNEL,
        Kernel::Electric => ELECTRIC_KERNEL,
        Kernel::Push => PUSH_KERNEL,
    };
    format!("{PRELUDE}{body}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Magnetic,
    Electric,
    Push,
}

impl Kernel {
    pub fn label(self) -> &'static str {
        match self {
            Kernel::Magnetic => "magnetic_kernel",
            Kernel::Electric => "electric_kernel",
            Kernel::Push => "push_kernel",
        }
    }
}

/// Workgroup counts covering `threads` invocations, spilling into the
/// second dimension past [`MAX_GROUPS_X`].
pub fn dispatch_size(threads: usize) -> (u32, u32) {
    let groups = (threads as u32).div_ceil(WORKGROUP_SIZE).max(1);
    if groups <= MAX_GROUPS_X {
        (groups, 1)
    } else {
        (MAX_GROUPS_X, groups.div_ceil(MAX_GROUPS_X))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_size() {
        assert_eq!(dispatch_size(1), (1, 1));
        assert_eq!(dispatch_size(256), (1, 1));
        assert_eq!(dispatch_size(257), (2, 1));
        let (x, y) = dispatch_size(20_000_000);
        assert_eq!(x, MAX_GROUPS_X);
        assert!(x as usize * y as usize * 256 >= 20_000_000);
    }

    #[test]
    fn test_thread_stride_matches_dispatch() {
        // Row stride hard-coded in the prelude
        assert!(PRELUDE.contains(&(MAX_GROUPS_X * WORKGROUP_SIZE).to_string()));
    }

    #[test]
    fn test_sources_have_entry_point() {
        for kernel in [Kernel::Magnetic, Kernel::Electric, Kernel::Push] {
            let src = kernel_source(kernel);
            assert!(src.contains("fn main"));
            assert!(src.contains("struct Layout"));
        }
    }
}
