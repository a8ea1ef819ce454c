use crate::error::{NavError, NavResult};
use crate::types::{LatLon, Point2};

const EARTH_RADIUS: f64 = 6_371_000.0; // meters

/// Local tangent-plane projection around a fixed reference point
///
/// Equirectangular approximation: accurate to a few centimeters within a few
/// kilometers of the reference, no guarantee beyond that.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GeoConverter {
    reference: Option<LatLon>,
}

impl GeoConverter {
    pub fn new() -> Self {
        Self { reference: None }
    }

    pub fn with_reference(reference: LatLon) -> Self {
        Self {
            reference: Some(reference),
        }
    }

    pub fn set_reference(&mut self, reference: LatLon) {
        self.reference = Some(reference);
    }

    pub fn reference(&self) -> Option<LatLon> {
        self.reference
    }

    pub fn is_initialized(&self) -> bool {
        self.reference.is_some()
    }

    /// Convert lat/lon to local meters (x east, y north) relative to the reference
    pub fn to_metric(&self, ll: LatLon) -> NavResult<Point2> {
        let origin = self.reference.ok_or(NavError::UninitializedReference)?;
        let d_lat = (ll.lat - origin.lat).to_radians();
        let d_lon = (ll.lon - origin.lon).to_radians();
        Ok(Point2::new(
            EARTH_RADIUS * d_lon * origin.lat.to_radians().cos(),
            EARTH_RADIUS * d_lat,
        ))
    }

    /// Inverse of [`GeoConverter::to_metric`]
    pub fn to_latlon(&self, p: Point2) -> NavResult<LatLon> {
        let origin = self.reference.ok_or(NavError::UninitializedReference)?;
        let d_lat = p.y / EARTH_RADIUS;
        let d_lon = p.x / (EARTH_RADIUS * origin.lat.to_radians().cos());
        Ok(LatLon::new(
            origin.lat + d_lat.to_degrees(),
            origin.lon + d_lon.to_degrees(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uninitialized_reference() {
        let conv = GeoConverter::new();
        assert!(matches!(
            conv.to_metric(LatLon::new(37.5, 127.0)),
            Err(NavError::UninitializedReference)
        ));
        assert!(matches!(
            conv.to_latlon(Point2::new(1.0, 1.0)),
            Err(NavError::UninitializedReference)
        ));
    }

    #[test]
    fn test_reference_maps_to_origin() {
        let conv = GeoConverter::with_reference(LatLon::new(36.38, 127.37));
        let p = conv.to_metric(LatLon::new(36.38, 127.37)).unwrap();
        assert_relative_eq!(p.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_within_few_km() {
        let conv = GeoConverter::with_reference(LatLon::new(36.38, 127.37));
        for (dlat, dlon) in [(0.01, 0.02), (-0.02, 0.015), (0.0, -0.03), (0.025, 0.0)] {
            let ll = LatLon::new(36.38 + dlat, 127.37 + dlon);
            let back = conv.to_latlon(conv.to_metric(ll).unwrap()).unwrap();
            assert_relative_eq!(back.lat, ll.lat, epsilon = 1e-9);
            assert_relative_eq!(back.lon, ll.lon, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_one_millidegree_north_is_about_111m() {
        let conv = GeoConverter::with_reference(LatLon::new(0.0, 0.0));
        let p = conv.to_metric(LatLon::new(0.001, 0.0)).unwrap();
        assert_relative_eq!(p.y, 111.19, epsilon = 0.01);
    }
}
