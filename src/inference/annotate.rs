use crate::inference::Detection;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

// 标注渲染常量
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色边框
const TEXT_COLOR: [u8; 3] = [0, 0, 0]; // 黑色文字
const BOX_THICKNESS: i32 = 3;
const FONT_SIZE: f32 = 20.0;
const LABEL_CHAR_WIDTH: f32 = 11.0; // 每字符平均宽度（粗略估计）
const LABEL_HEIGHT: i32 = 24;

/// 检测框与标签文字的绘制器
///
/// 字体文件可选；没有字体时仍然画框和标签底色，只是不写文字。
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| match std::fs::read(path) {
            Ok(bytes) => match FontVec::try_from_vec(bytes) {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!("Invalid font file {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Cannot read font file {}: {}", path.display(), e);
                None
            }
        });
        if font.is_none() {
            tracing::info!("No label font loaded, drawing boxes without text");
        }
        Self { font }
    }

    /// 在帧上叠加检测框与标签
    pub fn draw(&self, image: &mut RgbImage, detections: &[Detection]) {
        for detection in detections {
            self.draw_one(image, detection);
        }
    }

    fn draw_one(&self, image: &mut RgbImage, detection: &Detection) {
        let (w, h) = (image.width() as f32, image.height() as f32);
        let [ymin, xmin, ymax, xmax] = detection.box_2d;

        let x_min = ((xmin * w).floor() as i32).clamp(0, w as i32 - 1);
        let y_min = ((ymin * h).floor() as i32).clamp(0, h as i32 - 1);
        let x_max = ((xmax * w).ceil() as i32).clamp(0, w as i32 - 1);
        let y_max = ((ymax * h).ceil() as i32).clamp(0, h as i32 - 1);
        if x_min >= x_max || y_min >= y_max {
            return;
        }

        // 加粗边框：向内收缩逐像素描边
        for inset in 0..BOX_THICKNESS {
            let x0 = x_min + inset;
            let y0 = y_min + inset;
            let bw = (x_max - x_min - 2 * inset).max(1) as u32;
            let bh = (y_max - y_min - 2 * inset).max(1) as u32;
            draw_hollow_rect_mut(image, Rect::at(x0, y0).of_size(bw, bh), Rgb(BOX_COLOR));
        }

        // 标签底色画在框上方，放不下时画在框内顶部
        let text = format!("{} {:.2}", detection.label, detection.confidence);
        let text_width = ((text.len() as f32 * LABEL_CHAR_WIDTH) as i32).min(w as i32 - x_min);
        if text_width <= 0 {
            return;
        }
        let label_y = if y_min - LABEL_HEIGHT >= 0 {
            y_min - LABEL_HEIGHT
        } else {
            y_min
        };
        draw_filled_rect_mut(
            image,
            Rect::at(x_min, label_y).of_size(text_width as u32, LABEL_HEIGHT as u32),
            Rgb(BOX_COLOR),
        );

        if let Some(ref font) = self.font {
            draw_text_mut(
                image,
                Rgb(TEXT_COLOR),
                x_min + 2,
                label_y + 2,
                PxScale::from(FONT_SIZE),
                font,
                &text,
            );
        }
    }
}
