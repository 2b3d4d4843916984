use crate::types::{MediaItem, MediaKind, RenderSettings};

/// Total output length for a slideshow of `item_count` items: long enough for
/// each item to register and never shorter than the overall floor. The
/// caller's requested duration can only lengthen the result.
pub fn compute_duration(item_count: usize, requested: Option<f64>, per_item_min: f64, total_min: f64) -> f64 {
    let requested = requested.filter(|d| d.is_finite() && *d > 0.0).unwrap_or(0.0);
    total_min.max(item_count as f64 * per_item_min).max(requested)
}

/// Seconds each item occupies in the final video, in input order.
///
/// A lone video keeps its own length and skips the policy entirely. In every
/// other case videos keep their natural length and the images split whatever
/// the policy still demands, never dropping below the per-item minimum.
pub fn plan_slots(items: &[MediaItem], settings: &RenderSettings) -> Vec<f64> {
    if let [only] = items {
        if only.kind == MediaKind::Video {
            if let Some(d) = only.duration {
                return vec![d];
            }
        }
    }

    let target = compute_duration(items.len(), settings.requested_duration, settings.per_item_min, settings.total_min);
    let video_total: f64 = items
        .iter()
        .filter(|i| i.kind == MediaKind::Video)
        .filter_map(|i| i.duration)
        .sum();
    let image_count = items.iter().filter(|i| i.kind == MediaKind::Image).count();

    let image_slot = if image_count == 0 {
        0.0
    } else {
        let remaining = (target - video_total).max(image_count as f64 * settings.per_item_min);
        remaining / image_count as f64
    };

    items
        .iter()
        .map(|i| match i.kind {
            MediaKind::Image => image_slot,
            MediaKind::Video => i.duration.unwrap_or(settings.per_item_min),
        })
        .collect()
}
