//! Object detection seam.
//!
//! The detection model is an external collaborator behind `FrameProcessor`;
//! the service only sees per-object labels, confidences and boxes. Aggregate
//! counts are derived here so the published payload is stable across model
//! backends.

use serde::Serialize;

use super::capture::{Frame, VisionError};

/// One detected object.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [i32; 4],
}

/// Result of processing one frame.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionReport {
    pub detections: Vec<Detection>,
    pub fps: f64,
    pub latency_ms: f64,
}

/// Counts grouped the way the dashboard consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub person_count: u32,
    pub vehicle_count: u32,
    pub animal_count: u32,
}

/// Groups detections into person / vehicle / animal buckets.
pub fn count_groups(detections: &[Detection]) -> GroupCounts {
    let mut counts = GroupCounts {
        person_count: 0,
        vehicle_count: 0,
        animal_count: 0,
    };
    for det in detections {
        match det.label.as_str() {
            "person" => counts.person_count += 1,
            "car" | "truck" | "bus" | "motorcycle" => counts.vehicle_count += 1,
            "dog" | "cat" | "bird" => counts.animal_count += 1,
            _ => {}
        }
    }
    counts
}

/// Processes frames into detection reports.
pub trait FrameProcessor: Send {
    /// Loads the model. Failure aborts service startup.
    fn init(&mut self) -> Result<(), VisionError>;

    fn process(&mut self, frame: &Frame) -> DetectionReport;
}

/// Development processor: never detects anything.
pub struct NoopProcessor;

impl FrameProcessor for NoopProcessor {
    fn init(&mut self) -> Result<(), VisionError> {
        Ok(())
    }

    fn process(&mut self, _frame: &Frame) -> DetectionReport {
        DetectionReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str) -> Detection {
        Detection {
            label: label.into(),
            confidence: 0.9,
            bbox: [0, 0, 10, 10],
        }
    }

    #[test]
    fn groups_are_counted_by_label() {
        let detections = vec![
            det("person"),
            det("person"),
            det("car"),
            det("bus"),
            det("dog"),
            det("umbrella"),
        ];
        let counts = count_groups(&detections);
        assert_eq!(counts.person_count, 2);
        assert_eq!(counts.vehicle_count, 2);
        assert_eq!(counts.animal_count, 1);
    }

    #[test]
    fn empty_report_counts_zero() {
        let counts = count_groups(&[]);
        assert_eq!(
            counts,
            GroupCounts {
                person_count: 0,
                vehicle_count: 0,
                animal_count: 0
            }
        );
    }

    #[test]
    fn report_serializes_with_detections() {
        let report = DetectionReport {
            detections: vec![det("person")],
            fps: 14.2,
            latency_ms: 31.0,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["detections"][0]["label"], "person");
        assert_eq!(value["detections"][0]["bbox"][2], 10);
    }
}
