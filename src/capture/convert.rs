//! Pixel order conversion between the decoder's RGB and what a backend wants

use bytes::Bytes;

use super::frame::{Frame, PixelFormat};

impl Frame {
    /// Re-pack into `target`. Returns `None` for conversions we don't support
    /// (anything out of YUYV).
    pub fn convert(&self, target: PixelFormat) -> Option<Frame> {
        let data = match (self.format(), target) {
            (from, to) if from == to => return Some(self.clone()),
            (PixelFormat::Rgb24, PixelFormat::Bgr24) | (PixelFormat::Bgr24, PixelFormat::Rgb24) => {
                swap_red_blue(&self.data)
            }
            (PixelFormat::Rgb24, PixelFormat::Yuyv) => {
                packed_to_yuyv(&self.data, self.width(), self.height(), [0, 1, 2])
            }
            (PixelFormat::Bgr24, PixelFormat::Yuyv) => {
                packed_to_yuyv(&self.data, self.width(), self.height(), [2, 1, 0])
            }
            _ => return None,
        };

        Some(Frame {
            data: Bytes::from(data),
            meta: std::sync::Arc::new(super::frame::FrameMetadata {
                format: target,
                ..(*self.meta).clone()
            }),
            timestamp: self.timestamp,
        })
    }
}

fn swap_red_blue(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    for px in src.chunks_exact(3) {
        out.push(px[2]);
        out.push(px[1]);
        out.push(px[0]);
    }
    out
}

/// BT.601 limited range, chroma averaged over each horizontal pair.
/// `order` gives the R, G, B byte offsets inside a source pixel.
fn packed_to_yuyv(src: &[u8], width: u32, height: u32, order: [usize; 3]) -> Vec<u8> {
    let width = width as usize;
    let mut out = Vec::with_capacity(width * height as usize * 2);
    if width == 0 {
        return out;
    }

    for row in src.chunks_exact(width * 3).take(height as usize) {
        let mut pixels = row.chunks_exact(3);
        while let Some(p0) = pixels.next() {
            let (y0, u0, v0) = rgb_to_yuv(p0[order[0]], p0[order[1]], p0[order[2]]);
            match pixels.next() {
                Some(p1) => {
                    let (y1, u1, v1) = rgb_to_yuv(p1[order[0]], p1[order[1]], p1[order[2]]);
                    out.extend_from_slice(&[y0, avg(u0, u1), y1, avg(v0, v1)]);
                }
                // odd width: keep the line at width * 2 bytes
                None => out.extend_from_slice(&[y0, u0]),
            }
        }
    }
    out
}

fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (clamp(y), clamp(u), clamp(v))
}

fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16) / 2) as u8
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Frame {
        Frame::new(Bytes::from(data), 1, width, height, format)
    }

    #[test]
    fn rgb_bgr_swap() {
        let rgb = frame(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Rgb24);
        let bgr = rgb.convert(PixelFormat::Bgr24).unwrap();
        assert_eq!(&bgr.data[..], &[3, 2, 1, 6, 5, 4]);
        assert_eq!(bgr.format(), PixelFormat::Bgr24);
        assert_eq!(bgr.geometry(), (2, 1));
    }

    #[test]
    fn same_format_is_shared_not_copied() {
        let rgb = frame(vec![9; 12], 2, 2, PixelFormat::Rgb24);
        let same = rgb.convert(PixelFormat::Rgb24).unwrap();
        assert_eq!(same.data.as_ptr(), rgb.data.as_ptr());
    }

    #[test]
    fn yuyv_reference_values() {
        // white, black | red, red
        let rgb = frame(
            vec![255, 255, 255, 0, 0, 0, 255, 0, 0, 255, 0, 0],
            2,
            2,
            PixelFormat::Rgb24,
        );
        let yuyv = rgb.convert(PixelFormat::Yuyv).unwrap();
        assert_eq!(yuyv.data.len(), PixelFormat::Yuyv.frame_size(2, 2));
        assert_eq!(&yuyv.data[..4], &[235, 128, 16, 128]);
        assert_eq!(&yuyv.data[4..], &[82, 90, 82, 240]);
    }

    #[test]
    fn bgr_and_rgb_agree_on_yuyv() {
        let rgb = frame(vec![10, 20, 200, 90, 80, 70], 2, 1, PixelFormat::Rgb24);
        let bgr = rgb.convert(PixelFormat::Bgr24).unwrap();
        assert_eq!(
            rgb.convert(PixelFormat::Yuyv).unwrap().data,
            bgr.convert(PixelFormat::Yuyv).unwrap().data
        );
    }

    #[test]
    fn odd_width_keeps_line_length() {
        let rgb = frame(vec![0; 3 * 3 * 2], 3, 2, PixelFormat::Rgb24);
        let yuyv = rgb.convert(PixelFormat::Yuyv).unwrap();
        assert_eq!(yuyv.data.len(), 3 * 2 * 2);
    }

    #[test]
    fn yuyv_source_is_unsupported() {
        let yuyv = frame(vec![0; 8], 2, 2, PixelFormat::Yuyv);
        assert!(yuyv.convert(PixelFormat::Rgb24).is_none());
    }
}
