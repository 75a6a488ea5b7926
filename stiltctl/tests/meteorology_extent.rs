//! Property tests for the meteorology a scene requests.

use chrono::{Duration, TimeZone, Timelike, Utc};
use proptest::prelude::*;
use stiltctl::spatial::GridExtent;
use stiltctl::DomainConfig;

fn document(xmn: f64, width: f64, ymn: f64, height: f64, n_hours: i32, minute: u32) -> String {
    let cx = xmn + width / 2.0;
    let cy = ymn + height / 2.0;
    format!(
        "\
receptor_grid:
  xmin: {cx:.4}
  xmax: {cx:.4}
  xres: 0.01
  ymin: {cy:.4}
  ymax: {cy:.4}
  yres: 0.01
simulation_config:
  n_hours: {n_hours}
  xmn: {xmn:.4}
  xmx: {xmx:.4}
  xres: 0.01
  ymn: {ymn:.4}
  ymx: {ymx:.4}
  yres: 0.01
meteorology_model: hrrr
time: 2019-05-30 07:{minute:02}:00
",
        xmx = xmn + width,
        ymx = ymn + height,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_meteorology_extent_covers_every_simulation(
        xmn in -120.0f64..-80.0,
        width in 0.1f64..10.0,
        ymn in 25.0f64..40.0,
        height in 0.1f64..5.0,
        n_hours in -72i32..72,
        minute in 0u32..60,
    ) {
        let config = DomainConfig::from_yaml(&document(xmn, width, ymn, height, n_hours, minute))
            .unwrap();
        let extent = config.meteorology_extent().unwrap();
        let footprint = config.simulation_config().footprint_extent().unwrap();

        prop_assert!(extent.contains_extent(&footprint));
        let padded = GridExtent::new(
            footprint.xmin() - 0.2,
            footprint.xmax() + 0.2,
            footprint.ymin() - 0.2,
            footprint.ymax() + 0.2,
        )
        .unwrap();
        prop_assert!(extent.contains_extent(&padded));

        let start = config.time();
        let end = start + Duration::hours(i64::from(n_hours));
        prop_assert!(extent.tmin() <= start.min(end) - Duration::hours(1));
        prop_assert!(extent.tmax() >= start.max(end) + Duration::hours(1));
        prop_assert_eq!(extent.tmin().minute(), 0);
        prop_assert_eq!(extent.tmax().minute(), 0);

        let source = config.meteorology_model().source();
        let files = source.filenames_by_time_range(extent.tmin(), extent.tmax()).unwrap();
        let mut hour = extent.tmin();
        while hour <= extent.tmax() {
            prop_assert!(files.contains(&source.filename_by_time(hour)));
            hour += Duration::hours(1);
        }
    }
}

#[test]
fn test_reference_time_is_floored_before_extent() {
    let config = DomainConfig::from_yaml(&document(-112.5, 1.0, 40.1, 1.1, -2, 59)).unwrap();
    let extent = config.meteorology_extent().unwrap();
    assert_eq!(config.time(), Utc.with_ymd_and_hms(2019, 5, 30, 7, 0, 0).unwrap());
    assert_eq!(extent.tmin(), Utc.with_ymd_and_hms(2019, 5, 30, 4, 0, 0).unwrap());
    assert_eq!(extent.tmax(), Utc.with_ymd_and_hms(2019, 5, 30, 9, 0, 0).unwrap());
}
