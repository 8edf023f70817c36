//! Host copy of the field arrays mirrored onto a compute backend.

use tracing::trace;

use crate::backend::{ComputeBackend, ParticleBatch, PushParams};
use crate::error::{PicError, Result};
use crate::field::{FieldArrays, NodeRange};
use crate::field_solver::FieldCoefficients;

/// Which copy of the fields holds the latest values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Host was modified after the last upload.
    Host,
    /// Device was advanced after the last download.
    Device,
    Synced,
}

/// Field arrays on the host plus the backend holding the device copy.
///
/// Transfers are explicit. Device operations refuse to run on a stale
/// device copy and host mutation refuses to run on a stale host copy.
pub struct DeviceMirror<B: ComputeBackend> {
    host: FieldArrays,
    backend: Option<B>,
    residency: Residency,
}

impl<B: ComputeBackend> DeviceMirror<B> {
    /// Take ownership of `host` and upload it to `backend`.
    pub fn new(host: FieldArrays, mut backend: B) -> Result<Self> {
        backend.upload_fields(&host)?;
        trace!(backend = backend.name(), "initial field upload");
        Ok(Self {
            host,
            backend: Some(backend),
            residency: Residency::Synced,
        })
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn host(&self) -> &FieldArrays {
        &self.host
    }

    /// Mutable host fields. Marks the device copy stale.
    pub fn host_mut(&mut self) -> Result<&mut FieldArrays> {
        if self.residency == Residency::Device {
            return Err(PicError::Device(
                "host fields are stale, download before modifying them".into(),
            ));
        }
        self.residency = Residency::Host;
        Ok(&mut self.host)
    }

    pub fn backend(&self) -> Option<&B> {
        self.backend.as_ref()
    }

    fn backend_mut(&mut self) -> Result<&mut B> {
        self.backend
            .as_mut()
            .ok_or_else(|| PicError::Device("backend already released".into()))
    }

    pub fn upload(&mut self) -> Result<()> {
        let backend = self.backend.as_mut().ok_or_else(|| PicError::Device("backend already released".into()))?;
        backend.upload_fields(&self.host)?;
        trace!(backend = backend.name(), "fields uploaded");
        self.residency = Residency::Synced;
        Ok(())
    }

    pub fn download(&mut self) -> Result<()> {
        let backend = self.backend.as_mut().ok_or_else(|| PicError::Device("backend already released".into()))?;
        backend.download_fields(&mut self.host)?;
        trace!(backend = backend.name(), "fields downloaded");
        self.residency = Residency::Synced;
        Ok(())
    }

    fn require_device(&self, operation: &str) -> Result<()> {
        if self.residency == Residency::Host {
            return Err(PicError::Device(format!("{operation} on stale device fields")));
        }
        Ok(())
    }

    pub fn advance_magnetic(&mut self, coeffs: &FieldCoefficients, fraction: f64, range: NodeRange) -> Result<()> {
        self.require_device("magnetic update")?;
        self.backend_mut()?.advance_magnetic(coeffs, fraction, range)?;
        self.residency = Residency::Device;
        Ok(())
    }

    pub fn advance_electric(&mut self, coeffs: &FieldCoefficients, range: NodeRange) -> Result<()> {
        self.require_device("electric update")?;
        self.backend_mut()?.advance_electric(coeffs, range)?;
        self.residency = Residency::Device;
        Ok(())
    }

    /// Push with the device fields. Fails if the host holds newer values.
    pub fn push_particles(&mut self, batch: &mut ParticleBatch, params: &PushParams) -> Result<()> {
        self.require_device("particle push")?;
        self.backend_mut()?.push_particles(batch, params)
    }

    /// Release the backend and return the latest host fields.
    pub fn teardown(mut self) -> Result<FieldArrays> {
        if self.residency == Residency::Device {
            self.download()?;
        }
        if let Some(mut backend) = self.backend.take() {
            backend.release()?;
            trace!(backend = backend.name(), "backend released");
        }
        Ok(self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BatchSegment, CpuBackend, PackedParticle};
    use crate::field::FieldComponent;

    fn mirror() -> DeviceMirror<CpuBackend> {
        let n = [3, 3, 3];
        DeviceMirror::new(FieldArrays::zeros(n), CpuBackend::new(n)).unwrap()
    }

    #[test]
    fn test_residency_transitions() {
        let mut m = mirror();
        let coeffs = FieldCoefficients::new(0.1, [1.0; 3]);
        let range = NodeRange::interior([3, 3, 3]);
        assert_eq!(m.residency(), Residency::Synced);

        m.host_mut().unwrap().get_mut(FieldComponent::Ex).set(1, 1, 1, 1.0);
        assert_eq!(m.residency(), Residency::Host);
        assert!(m.advance_magnetic(&coeffs, 0.5, range).is_err());

        m.upload().unwrap();
        m.advance_magnetic(&coeffs, 0.5, range).unwrap();
        assert_eq!(m.residency(), Residency::Device);
        assert!(m.host_mut().is_err());

        m.download().unwrap();
        assert!(m.host().get(FieldComponent::Hy).get(1, 1, 0) != 0.0);
        assert!(m.host_mut().is_ok());
    }

    #[test]
    fn test_teardown_downloads() {
        let mut m = mirror();
        let coeffs = FieldCoefficients::new(0.1, [1.0; 3]);
        m.host_mut().unwrap().get_mut(FieldComponent::Jz).set(1, 1, 1, 1.0);
        m.upload().unwrap();
        m.advance_electric(&coeffs, NodeRange::interior([3, 3, 3])).unwrap();
        let host = m.teardown().unwrap();
        assert!((host.get(FieldComponent::Ez).get(1, 1, 1) + 0.1).abs() < 1e-15);
    }

    #[test]
    fn test_push_never_uploads_implicitly() {
        let mut m = mirror();
        m.host_mut().unwrap().get_mut(FieldComponent::Ez).as_mut_slice().fill(1.0);
        let params = PushParams {
            tau: 0.1,
            h: [1.0; 3],
            cells: [3, 3, 3],
        };
        let mut batch = ParticleBatch {
            particles: vec![PackedParticle {
                position: [1.5, 1.5, 1.5],
                momentum: [0.0; 3],
                q_m: 1.0,
            }],
            segments: vec![BatchSegment { cell: 13, range: 0..1 }],
        };

        assert!(matches!(m.push_particles(&mut batch, &params), Err(PicError::Device(_))));
        assert_eq!(m.residency(), Residency::Host);
        assert_eq!(batch.particles[0].momentum, [0.0; 3]);

        m.upload().unwrap();
        m.push_particles(&mut batch, &params).unwrap();
        assert_eq!(m.residency(), Residency::Synced);
        assert!((batch.particles[0].momentum[2] - 0.1).abs() < 1e-12);
    }
}
