use crate::core::compositor::{DateRange, Scene};
use crate::types::{BackcastResult, BoundingBox, Sensor};

/// Queryable source of per-sensor index observations
pub trait ObservationSource: Sync {
    /// Scenes of `sensor` acquired within `range` that overlap `bounds`
    fn scenes(&self, sensor: Sensor, range: &DateRange, bounds: &BoundingBox) -> BackcastResult<Vec<Scene>>;
}

/// Observation source backed by scenes already in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryObservations {
    scenes: Vec<Scene>,
}

impl InMemoryObservations {
    pub fn new(scenes: Vec<Scene>) -> Self {
        Self { scenes }
    }

    pub fn push(&mut self, scene: Scene) {
        self.scenes.push(scene);
    }

    pub fn len(&self) -> usize {
        self.scenes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenes.is_empty()
    }
}

impl ObservationSource for InMemoryObservations {
    fn scenes(&self, sensor: Sensor, range: &DateRange, bounds: &BoundingBox) -> BackcastResult<Vec<Scene>> {
        let selected: Vec<Scene> = self
            .scenes
            .iter()
            .filter(|s| {
                s.sensor == sensor
                    && range.contains(&s.acquired)
                    && s.index().grid().extent().intersects(bounds)
            })
            .cloned()
            .collect();
        log::debug!(
            "{} scenes of {} between {} and {}",
            selected.len(),
            sensor,
            range.start,
            range.end
        );
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compositor::SeasonalWindow;
    use crate::types::{GeoTransform, GridSpec, Raster};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_filters_by_sensor_date_and_bounds() {
        let grid = GridSpec::new(2, 2, GeoTransform::north_up(0.0, 2.0, 1.0), "EPSG:32635");
        let at = |m, d| Utc.with_ymd_and_hms(1980, m, d, 9, 30, 0).unwrap();
        let scene = |sensor, m, d| Scene::from_index(sensor, at(m, d), Raster::filled(grid.clone(), 0.4)).unwrap();
        let source = InMemoryObservations::new(vec![
            scene(Sensor::Landsat3Mss, 7, 1),
            scene(Sensor::Landsat3Mss, 11, 1),
            scene(Sensor::Landsat2Mss, 7, 2),
        ]);
        let range = SeasonalWindow::default().date_range(1980).unwrap();
        let inside = BoundingBox { min_x: 0.5, max_x: 1.5, min_y: 0.5, max_y: 1.5 };
        let far = BoundingBox { min_x: 50.0, max_x: 60.0, min_y: 50.0, max_y: 60.0 };

        assert_eq!(source.scenes(Sensor::Landsat3Mss, &range, &inside).unwrap().len(), 1);
        assert_eq!(source.scenes(Sensor::Landsat2Mss, &range, &inside).unwrap().len(), 1);
        assert!(source.scenes(Sensor::Landsat3Mss, &range, &far).unwrap().is_empty());
    }
}
