//! A wandering drone, the one replicated body the demo simulates.

use rand::Rng;
use tidal_sync::{FieldValue, Pose, Replicated, SimulatedBody};

#[derive(Debug, Clone, PartialEq)]
pub struct Drone {
    pose: Pose,
    velocity: (f64, f64),
    spin: f64,
    callsign: String,
}

impl Drone {
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            pose: Pose {
                x: rng.gen_range(-50.0..50.0),
                y: rng.gen_range(-50.0..50.0),
                rotation: 0.0,
            },
            velocity: (rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0)),
            spin: rng.gen_range(-1.0..1.0),
            callsign: format!("D-{:03}", rng.gen_range(0..1000)),
        }
    }

    /// Advance the local physics by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        self.pose.x += self.velocity.0 * dt;
        self.pose.y += self.velocity.1 * dt;
        self.pose.rotation = (self.pose.rotation + self.spin * dt).rem_euclid(std::f64::consts::TAU);
    }
}

impl Replicated for Drone {
    fn type_name(&self) -> &'static str {
        "Drone"
    }

    fn visit_fields(&self, visit: &mut dyn FnMut(&'static str, FieldValue)) {
        visit("x", self.pose.x.into());
        visit("y", self.pose.y.into());
        visit("rotation", self.pose.rotation.into());
        visit("callsign", self.callsign.as_str().into());
    }

    fn assign_field(&mut self, name: &str, value: &FieldValue) -> bool {
        match (name, value) {
            ("x", FieldValue::Number(n)) => self.pose.x = *n,
            ("y", FieldValue::Number(n)) => self.pose.y = *n,
            ("rotation", FieldValue::Number(n)) => self.pose.rotation = *n,
            ("callsign", FieldValue::Text(s)) => self.callsign = s.clone(),
            _ => return false,
        }
        true
    }
}

impl SimulatedBody for Drone {
    fn pose(&self) -> Pose {
        self.pose
    }
}
