//! Box format conversions on `[.., 4]` tensors.

use crate::common::*;

/// Converts `(cx, cy, w, h)` boxes to `(x1, y1, x2, y2)`.
pub fn cxcywh_to_xyxy(boxes: &Tensor) -> Tensor {
    let parts = boxes.unbind(-1);
    let (cx, cy, w, h) = (&parts[0], &parts[1], &parts[2], &parts[3]);
    Tensor::stack(
        &[
            cx - w * 0.5,
            cy - h * 0.5,
            cx + w * 0.5,
            cy + h * 0.5,
        ],
        -1,
    )
}

/// Converts `(x1, y1, x2, y2)` boxes to `(x, y, w, h)`.
pub fn xyxy_to_xywh(boxes: &Tensor) -> Tensor {
    let parts = boxes.unbind(-1);
    let (x1, y1, x2, y2) = (&parts[0], &parts[1], &parts[2], &parts[3]);
    Tensor::stack(&[x1.shallow_clone(), y1.shallow_clone(), x2 - x1, y2 - y1], -1)
}

/// Clamps `(x1, y1, x2, y2)` boxes into `[0, width - 1] x [0, height - 1]`.
pub fn clip_xyxy(boxes: &Tensor, [height, width]: [i64; 2]) -> Tensor {
    let x_max = (width - 1) as f64;
    let y_max = (height - 1) as f64;
    let parts = boxes.unbind(-1);
    Tensor::stack(
        &[
            parts[0].clamp(0.0, x_max),
            parts[1].clamp(0.0, y_max),
            parts[2].clamp(0.0, x_max),
            parts[3].clamp(0.0, y_max),
        ],
        -1,
    )
}
