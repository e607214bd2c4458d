/// Site registry for the kayakability service.
///
/// Defines the built-in list of river sites scored by the service, along
/// with the paddling ranges used to shape each site's discharge and gage
/// height response curves. A configuration file may replace this list; see
/// `config::Config::sites`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Site metadata
// ---------------------------------------------------------------------------

/// Static metadata for a built-in site.
pub struct SiteSpec {
    /// 8-digit USGS site code.
    pub site_id: &'static str,
    /// Official USGS site name.
    pub name: &'static str,
    /// WGS84 latitude.
    pub latitude: f64,
    /// WGS84 longitude.
    pub longitude: f64,
    /// Whitewater class for paddlers.
    pub difficulty: &'static str,
    /// Discharge range (cfs) considered ideal for paddling.
    pub ideal_discharge_cfs: (f64, f64),
    /// Gage height range (ft) considered ideal for paddling.
    pub ideal_gage_height_ft: (f64, f64),
    /// Nearest ASOS station (IEM identifier) for weather readings.
    pub weather_station: Option<&'static str>,
}

/// Owned site description, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub site_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub difficulty: String,
    pub ideal_discharge_cfs: (f64, f64),
    pub ideal_gage_height_ft: (f64, f64),
    #[serde(default)]
    pub weather_station: Option<String>,
}

impl From<&SiteSpec> for Site {
    fn from(spec: &SiteSpec) -> Self {
        Site {
            site_id: spec.site_id.to_string(),
            name: spec.name.to_string(),
            latitude: spec.latitude,
            longitude: spec.longitude,
            difficulty: spec.difficulty.to_string(),
            ideal_discharge_cfs: spec.ideal_discharge_cfs,
            ideal_gage_height_ft: spec.ideal_gage_height_ft,
            weather_station: spec.weather_station.map(String::from),
        }
    }
}

/// Merrimack River gauges, ordered from downstream to upstream.
///
/// Sources:
///   - Site codes: USGS NWIS (waterservices.usgs.gov)
///   - Weather stations: IEM ASOS network (mesonet.agron.iastate.edu)
pub static SITE_REGISTRY: &[SiteSpec] = &[
    SiteSpec {
        site_id: "01073500",
        name: "Merrimack River below Concord River at Lowell, MA",
        latitude: 42.6334,
        longitude: -71.3162,
        difficulty: "Class I-II",
        ideal_discharge_cfs: (800.0, 2000.0),
        ideal_gage_height_ft: (2.0, 4.5),
        weather_station: Some("BED"),
    },
    SiteSpec {
        site_id: "01100000",
        name: "Merrimack River at Lowell, MA",
        latitude: 42.65,
        longitude: -71.30,
        difficulty: "Class I-II",
        ideal_discharge_cfs: (1000.0, 2500.0),
        ideal_gage_height_ft: (1.5, 5.0),
        weather_station: Some("BED"),
    },
    SiteSpec {
        site_id: "01096500",
        name: "Merrimack River at North Chelmsford, MA",
        latitude: 42.6278,
        longitude: -71.3667,
        difficulty: "Class I-II",
        ideal_discharge_cfs: (800.0, 2200.0),
        ideal_gage_height_ft: (2.0, 4.8),
        weather_station: Some("BED"),
    },
    SiteSpec {
        site_id: "01094000",
        name: "Merrimack River near Goffs Falls below Manchester, NH",
        latitude: 43.0167,
        longitude: -71.4833,
        difficulty: "Class II",
        ideal_discharge_cfs: (600.0, 1800.0),
        ideal_gage_height_ft: (1.8, 4.2),
        weather_station: Some("MHT"),
    },
    SiteSpec {
        site_id: "01092000",
        name: "Merrimack River at Franklin Junction, NH",
        latitude: 43.4361,
        longitude: -71.6472,
        difficulty: "Class I",
        ideal_discharge_cfs: (400.0, 1500.0),
        ideal_gage_height_ft: (1.5, 3.8),
        weather_station: Some("CON"),
    },
];

/// All built-in sites as owned `Site`s.
pub fn default_sites() -> Vec<Site> {
    SITE_REGISTRY.iter().map(Site::from).collect()
}

/// Keeps only the sites named in `selector`, preserving configuration order.
/// An empty selector keeps every site.
pub fn select_sites(sites: &[Site], selector: &[String]) -> Vec<Site> {
    if selector.is_empty() {
        return sites.to_vec();
    }
    sites
        .iter()
        .filter(|s| selector.iter().any(|id| id == &s.site_id))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
