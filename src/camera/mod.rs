//! 摄像头会话管理
//!
//! 摄像头硬件访问是外部帧源，这里只定义接缝trait；进程内最多
//! 持有一个打开的设备句柄，跨请求复用。

#[cfg(feature = "v4l-camera")]
pub mod v4l;

use crate::{DetectError, Result};
use image::RgbImage;
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// 打开的摄像头设备
pub trait CameraDevice: Send {
    fn read_frame(&mut self) -> Result<RgbImage>;
}

/// 摄像头后端（设备枚举与打开）
pub trait CameraBackend: Send + Sync {
    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>>;
}

struct OpenSession {
    index: u32,
    device: Box<dyn CameraDevice>,
}

/// 摄像头会话管理器
///
/// 单一共享槽位：无论请求哪个设备索引，进程内同时只有一个打开的
/// 设备，已打开时直接复用（与原有行为一致，按索引分槽是可能的
/// 增强而非当前契约）。假定同一时刻只有一个调用方驱动取帧。
pub struct WebcamManager {
    backend: Option<Arc<dyn CameraBackend>>,
    slot: Mutex<Option<OpenSession>>,
}

impl WebcamManager {
    pub fn new(backend: Option<Arc<dyn CameraBackend>>) -> Self {
        Self {
            backend,
            slot: Mutex::new(None),
        }
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    fn backend(&self) -> Result<&Arc<dyn CameraBackend>> {
        self.backend.as_ref().ok_or_else(|| {
            DetectError::CameraBackendUnavailable("camera backend not available".to_string())
        })
    }

    /// 取一帧；惰性打开设备，读失败时关闭重开恢复一次
    ///
    /// 每次调用最多重试一次，避免坏设备上的无界阻塞。
    pub fn capture_frame(&self, index: u32) -> Result<RgbImage> {
        let backend = self.backend()?;
        let mut slot = self.slot.lock();

        if slot.is_none() {
            let device = backend
                .open(index)
                .map_err(|_| DetectError::CameraUnavailable(index))?;
            tracing::info!("Opened camera {}", index);
            *slot = Some(OpenSession { index, device });
        }

        let session = slot.as_mut().unwrap_or_else(|| unreachable!());
        match session.device.read_frame() {
            Ok(frame) => Ok(frame),
            Err(e) => {
                tracing::warn!("Camera read failed, reopening once: {}", e);
                let reopen_index = session.index;
                *slot = None;

                let device = backend
                    .open(reopen_index)
                    .map_err(|_| DetectError::CameraUnavailable(reopen_index))?;
                *slot = Some(OpenSession {
                    index: reopen_index,
                    device,
                });
                let session = slot.as_mut().unwrap_or_else(|| unreachable!());
                match session.device.read_frame() {
                    Ok(frame) => Ok(frame),
                    Err(e) => {
                        *slot = None;
                        Err(DetectError::CameraRead(e.to_string()))
                    }
                }
            }
        }
    }

    /// 释放设备；可重复调用
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        if slot.take().is_some() {
            tracing::info!("Webcam released");
        }
    }

    /// 有界探测：逐个尝试打开并立即关闭
    pub fn probe(&self, range: Range<u32>) -> Vec<u32> {
        let Ok(backend) = self.backend() else {
            return Vec::new();
        };
        range
            .filter(|&index| backend.open(index).is_ok())
            .collect()
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeCameraBackend;
    use std::sync::atomic::Ordering;

    fn manager() -> (WebcamManager, Arc<FakeCameraBackend>) {
        let backend = Arc::new(FakeCameraBackend::new());
        (WebcamManager::new(Some(backend.clone())), backend)
    }

    #[test]
    fn consecutive_frames_reuse_one_open_call() {
        let (manager, backend) = manager();

        manager.capture_frame(0).unwrap();
        manager.capture_frame(0).unwrap();

        assert_eq!(backend.open_count.load(Ordering::SeqCst), 1);
        assert!(manager.is_open());
    }

    #[test]
    fn read_failure_triggers_exactly_one_reopen() {
        let (manager, backend) = manager();
        manager.capture_frame(0).unwrap();

        backend.read_failures.store(1, Ordering::SeqCst);
        manager.capture_frame(0).unwrap();

        // 初次打开 + 恢复重开
        assert_eq!(backend.open_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn double_read_failure_surfaces_hard_error_and_closes() {
        let (manager, backend) = manager();
        manager.capture_frame(0).unwrap();

        backend.read_failures.store(2, Ordering::SeqCst);
        let err = manager.capture_frame(0).unwrap_err();
        assert!(matches!(err, DetectError::CameraRead(_)));
        assert!(!manager.is_open());
        // 恢复只尝试了一次
        assert_eq!(backend.open_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unopenable_device_maps_to_camera_unavailable() {
        let backend = Arc::new({
            let mut b = FakeCameraBackend::new();
            b.fail_open.insert(3);
            b
        });
        let manager = WebcamManager::new(Some(backend));

        let err = manager.capture_frame(3).unwrap_err();
        assert!(matches!(err, DetectError::CameraUnavailable(3)));
    }

    #[test]
    fn release_is_idempotent() {
        let (manager, _backend) = manager();
        manager.capture_frame(0).unwrap();

        manager.release();
        manager.release();
        assert!(!manager.is_open());
    }

    #[test]
    fn probe_reports_openable_indices() {
        let backend = Arc::new({
            let mut b = FakeCameraBackend::new();
            b.fail_open.insert(1);
            b.fail_open.insert(4);
            b
        });
        let manager = WebcamManager::new(Some(backend));

        assert_eq!(manager.probe(0..5), vec![0, 2, 3]);
    }

    #[test]
    fn no_backend_probe_is_empty() {
        let manager = WebcamManager::new(None);
        assert!(manager.probe(0..5).is_empty());
        assert!(matches!(
            manager.capture_frame(0).unwrap_err(),
            DetectError::CameraBackendUnavailable(_)
        ));
    }

    #[test]
    fn missing_backend_error_names_the_camera_subsystem() {
        let manager = WebcamManager::new(None);
        let err = manager.capture_frame(0).unwrap_err();
        assert_eq!(err.error_code(), "CAMERA_BACKEND_UNAVAILABLE");
        assert_eq!(
            err.status_code(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
