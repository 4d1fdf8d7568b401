//! V4L2摄像头后端
//!
//! v4l 的 Stream 需要引用 Device；用 Pin<Box> 固定设备的内存位置，
//! 让引用它的 Stream 可以安全地存进同一个结构体。

use crate::camera::{CameraBackend, CameraDevice};
use crate::{DetectError, Result};
use image::RgbImage;
use std::pin::Pin;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn open(&self, index: u32) -> Result<Box<dyn CameraDevice>> {
        Ok(Box::new(V4lDevice::open(index)?))
    }
}

pub struct V4lDevice {
    device: Pin<Box<Device>>,
    stream: Option<Stream<'static>>,
    width: u32,
    height: u32,
}

impl V4lDevice {
    fn open(index: u32) -> Result<Self> {
        let device = Box::pin(Device::new(index as usize).map_err(|e| {
            tracing::debug!("Cannot open /dev/video{}: {}", index, e);
            DetectError::CameraUnavailable(index)
        })?);

        let mut format = device
            .format()
            .map_err(|e| DetectError::CameraRead(e.to_string()))?;
        format.width = 640;
        format.height = 480;
        format.fourcc = FourCC::new(b"YUYV");
        let format = device
            .set_format(&format)
            .map_err(|e| DetectError::CameraRead(e.to_string()))?;

        let mut opened = Self {
            device,
            stream: None,
            width: format.width,
            height: format.height,
        };

        // SAFETY: device 被 Pin<Box> 固定不会移动；stream 存在同一个
        // 结构体里且在 Drop 中先于 device 释放，引用始终有效。
        let device_ref: &Device = &opened.device;
        let stream = unsafe {
            let device_static: &'static Device = std::mem::transmute(device_ref);
            Stream::with_buffers(device_static, Type::VideoCapture, 4)
                .map_err(|e| DetectError::CameraRead(format!("cannot create stream: {}", e)))?
        };
        opened.stream = Some(stream);

        Ok(opened)
    }
}

impl Drop for V4lDevice {
    fn drop(&mut self) {
        // stream 必须先于 device 释放
        self.stream.take();
    }
}

impl CameraDevice for V4lDevice {
    fn read_frame(&mut self) -> Result<RgbImage> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DetectError::CameraRead("stream closed".to_string()))?;

        let (buffer, _meta) = stream
            .next()
            .map_err(|e| DetectError::CameraRead(format!("frame grab failed: {}", e)))?;

        let rgb = yuyv_to_rgb(buffer, self.width, self.height);
        RgbImage::from_raw(self.width, self.height, rgb)
            .ok_or_else(|| DetectError::CameraRead("frame buffer size mismatch".to_string()))
    }
}

/// YUYV 4:2:2 转 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);

    for chunk in yuyv.chunks(4) {
        if chunk.len() < 4 {
            break;
        }

        let y0 = chunk[0] as f32;
        let u = chunk[1] as f32 - 128.0;
        let y1 = chunk[2] as f32;
        let v = chunk[3] as f32 - 128.0;

        for y in [y0, y1] {
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }

    rgb
}
