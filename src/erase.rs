use crate::models::{Shape, ShapeKind, Stroke};

// Eraser hit testing: everything is tested against the eraser disk
// (cx, cy, r). Callers are responsible for skipping locked entities.

/// A stroke is hit if any of its points lies within the disk.
pub fn stroke_hits_circle(stroke: &Stroke, cx: f64, cy: f64, r: f64) -> bool {
    let rr = r * r;
    stroke.points.iter().any(|pt| {
        let dx = pt.x - cx;
        let dy = pt.y - cy;
        dx * dx + dy * dy <= rr
    })
}

/// Shape-vs-disk test, by shape kind:
/// - line: distance from the disk center to the clamped segment ≤ r
/// - rect: squared distance from the center to the AABB ≤ r²
/// - circle: center-to-center distance ≤ shape radius + r
pub fn shape_hits_circle(shape: &Shape, cx: f64, cy: f64, r: f64) -> bool {
    let rr = r * r;
    match shape.kind {
        ShapeKind::Line => {
            let vx = shape.x2 - shape.x1;
            let vy = shape.y2 - shape.y1;
            let seg_len2 = vx * vx + vy * vy;
            if seg_len2 == 0.0 {
                let dx = cx - shape.x1;
                let dy = cy - shape.y1;
                return dx * dx + dy * dy <= rr;
            }
            let t = ((cx - shape.x1) * vx + (cy - shape.y1) * vy) / seg_len2;
            let t = t.clamp(0.0, 1.0);
            let px = shape.x1 + t * vx;
            let py = shape.y1 + t * vy;
            let dx = cx - px;
            let dy = cy - py;
            dx * dx + dy * dy <= rr
        }
        ShapeKind::Rect => {
            let minx = shape.x1.min(shape.x2);
            let maxx = shape.x1.max(shape.x2);
            let miny = shape.y1.min(shape.y2);
            let maxy = shape.y1.max(shape.y2);
            let dx = (minx - cx).max(0.0).max(cx - maxx);
            let dy = (miny - cy).max(0.0).max(cy - maxy);
            dx * dx + dy * dy <= rr
        }
        ShapeKind::Circle => {
            // (x1, y1) is the center; (x2, y2) is a point on the rim.
            let radius = (shape.x2 - shape.x1).hypot(shape.y2 - shape.y1);
            let dist = (cx - shape.x1).hypot(cy - shape.y1);
            dist <= radius + r
        }
    }
}
