//! Folds engine-driven movement of locally simulated bodies back into the
//! authoritative record as deltas.

use crate::client::Client;
use crate::engine::ReconciliationEngine;
use crate::record::{EntityId, Replicated};

/// Position and heading of a simulated body.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Radians.
    pub rotation: f64,
}

impl Pose {
    /// Record field names the pose maps onto.
    pub const FIELDS: [&'static str; 3] = ["x", "y", "rotation"];

    fn delta_from(&self, earlier: &Pose) -> [(&'static str, f64); 3] {
        let [x, y, rotation] = Self::FIELDS;
        [
            (x, self.x - earlier.x),
            (y, self.y - earlier.y),
            (rotation, self.rotation - earlier.rotation),
        ]
    }
}

/// A replicated object that a local physics step moves.
pub trait SimulatedBody: Replicated {
    fn pose(&self) -> Pose;
}

/// End-of-tick bridge for one simulated entity.
///
/// The cached pose is taken after the body re-reads its record, so the next
/// delta only carries what the local simulation did since then.
#[derive(Debug, Clone)]
pub struct DeltaBridge {
    entity: EntityId,
    cache: Option<Pose>,
}

impl DeltaBridge {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            cache: None,
        }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    pub fn cached_pose(&self) -> Option<Pose> {
        self.cache
    }

    /// Submit the movement since the last tick, pull the authoritative
    /// fields back into `body`, then cache its pose.
    pub fn end_tick<B: SimulatedBody>(
        &mut self,
        body: &mut B,
        engine: &mut ReconciliationEngine,
        requestor: &Client,
    ) {
        if let Some(previous) = self.cache {
            let delta = body.pose().delta_from(&previous);
            if delta.iter().any(|(_, d)| *d != 0.0)
                && !engine.apply_delta(requestor, self.entity, &delta)
            {
                tracing::debug!(
                    "Movement of {} by {} not applied; body resyncs from the record",
                    self.entity,
                    requestor.id
                );
            }
        }
        if let Some(record) = engine.get(self.entity) {
            body.read_record(record);
        }
        self.cache = Some(body.pose());
    }

    /// Forget the cached pose, e.g. after a teleport.
    pub fn reset(&mut self) {
        self.cache = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::{ClientDirectory, ClientId};
    use crate::engine::SyncSettings;
    use crate::queue::ActionKind;
    use crate::record::FieldValue;

    #[derive(Debug, Default)]
    struct Puck {
        pose: Pose,
    }

    impl Replicated for Puck {
        fn type_name(&self) -> &'static str {
            "Puck"
        }

        fn visit_fields(&self, visit: &mut dyn FnMut(&'static str, FieldValue)) {
            visit("x", self.pose.x.into());
            visit("y", self.pose.y.into());
            visit("rotation", self.pose.rotation.into());
        }

        fn assign_field(&mut self, name: &str, value: &FieldValue) -> bool {
            let Some(n) = value.as_number() else {
                return false;
            };
            match name {
                "x" => self.pose.x = n,
                "y" => self.pose.y = n,
                "rotation" => self.pose.rotation = n,
                _ => return false,
            }
            true
        }
    }

    impl SimulatedBody for Puck {
        fn pose(&self) -> Pose {
            self.pose
        }
    }

    fn setup() -> (ReconciliationEngine, Client, Puck) {
        let owner = Client::new(ClientId(2), "pilot");
        let directory = Arc::new(ClientDirectory::new(Client::new(ClientId::HOST, "host")));
        let mut engine = ReconciliationEngine::new(directory, SyncSettings::default()).unwrap();
        let puck = Puck::default();
        engine.try_enqueue(puck.to_record(EntityId(1), owner.id), ActionKind::Create, &owner);
        engine.update();
        (engine, owner, puck)
    }

    #[test]
    fn test_first_tick_only_fills_cache() {
        let (mut engine, owner, mut puck) = setup();
        let mut bridge = DeltaBridge::new(EntityId(1));
        puck.pose.x = 5.0;
        bridge.end_tick(&mut puck, &mut engine, &owner);

        // No prior cache: the record wins and no delta is submitted.
        assert_eq!(engine.get(EntityId(1)).unwrap().number("x"), Some(0.0));
        assert_eq!(puck.pose.x, 0.0);
        assert_eq!(bridge.cached_pose(), Some(Pose::default()));
    }

    #[test]
    fn test_delta_lands_on_current_authoritative_value() {
        let (mut engine, owner, mut puck) = setup();
        let mut bridge = DeltaBridge::new(EntityId(1));
        bridge.end_tick(&mut puck, &mut engine, &owner);

        // Someone else moved the record meanwhile.
        let host = Client::new(ClientId::HOST, "host");
        engine.try_enqueue(
            puck.to_record(EntityId(1), owner.id).with("x", 10.0),
            ActionKind::Update,
            &host,
        );
        engine.update();

        puck.pose.x += 1.5;
        puck.pose.rotation += 0.25;
        bridge.end_tick(&mut puck, &mut engine, &owner);

        let record = engine.get(EntityId(1)).unwrap();
        assert_eq!(record.number("x"), Some(11.5));
        assert_eq!(record.number("rotation"), Some(0.25));
        assert_eq!(puck.pose.x, 11.5);
        assert_eq!(bridge.cached_pose().unwrap().x, 11.5);
    }

    #[test]
    fn test_rejected_delta_resyncs_body_from_record() {
        let (mut engine, owner, mut puck) = setup();
        let stranger = Client::new(ClientId(9), "stranger");
        let mut bridge = DeltaBridge::new(EntityId(1));
        bridge.end_tick(&mut puck, &mut engine, &stranger);

        puck.pose.x = 7.0;
        bridge.end_tick(&mut puck, &mut engine, &stranger);
        assert_eq!(engine.get(EntityId(1)).unwrap().number("x"), Some(0.0));
        assert_eq!(puck.pose.x, 0.0);

        // The owner's movement still lands.
        puck.pose.x = 2.0;
        bridge.end_tick(&mut puck, &mut engine, &owner);
        assert_eq!(engine.get(EntityId(1)).unwrap().number("x"), Some(2.0));
    }

    #[test]
    fn test_pose_fields_name_record_fields() {
        let puck = Puck::default();
        let record = puck.to_record(EntityId(1), ClientId(2));
        for name in Pose::FIELDS {
            assert_eq!(record.number(name), Some(0.0));
        }
    }

    #[test]
    fn test_missing_record_leaves_body_alone() {
        let (mut engine, owner, mut puck) = setup();
        let mut bridge = DeltaBridge::new(EntityId(99));
        puck.pose.y = 3.0;
        bridge.end_tick(&mut puck, &mut engine, &owner);
        puck.pose.y = 4.0;
        bridge.end_tick(&mut puck, &mut engine, &owner);
        assert_eq!(puck.pose.y, 4.0);
        assert!(engine.get(EntityId(99)).is_none());

        bridge.reset();
        assert!(bridge.cached_pose().is_none());
    }
}
