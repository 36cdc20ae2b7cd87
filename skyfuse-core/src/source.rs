//! Source tiers and their default priority scores.
//!
//! Producers normally send an explicit `sourcePriority`. When they do not,
//! the score is looked up here from the source name. Higher scores win
//! merges.

/// Score assigned when neither a priority nor a known source name is given.
pub const LOWEST_PRIORITY: i32 = 0;

/// Closed set of report origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// ADS-B 1090ES from the aircraft itself.
    Adsb,
    /// 978 MHz UAT.
    Uat,
    /// ADS-B rebroadcast.
    Adsr,
    /// ADS-C (satellite contract reports).
    Adsc,
    /// Multilateration.
    Mlat,
    /// TIS-B, ground radar rebroadcast.
    Tisb,
    Flarm,
    /// Mode S without position.
    ModeS,
    /// Third-party aggregator feed of unknown underlying quality.
    Aggregator,
    /// Extrapolated by a predictor, never directly observed.
    Predicted,
    Unknown,
}

/// Default score per tier.
const PRIORITY_TABLE: [(SourceKind, &str, i32); 11] = [
    (SourceKind::Adsb, "adsb", 80),
    (SourceKind::Uat, "uat", 75),
    (SourceKind::Adsr, "adsr", 70),
    (SourceKind::Adsc, "adsc", 60),
    (SourceKind::Mlat, "mlat", 50),
    (SourceKind::Tisb, "tisb", 40),
    (SourceKind::Flarm, "flarm", 35),
    (SourceKind::ModeS, "mode_s", 30),
    (SourceKind::Aggregator, "aggregator", 20),
    (SourceKind::Predicted, "predicted", 10),
    (SourceKind::Unknown, "unknown", LOWEST_PRIORITY),
];

impl SourceKind {
    /// Classify a free-form source name.
    ///
    /// Accepts the plain tier names as well as readsb message types such as
    /// `adsb_icao_nt` or `tisb_trackfile`.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase().replace('-', "_");
        match name.as_str() {
            n if n.starts_with("adsb") => SourceKind::Adsb,
            n if n.starts_with("adsr") => SourceKind::Adsr,
            n if n.starts_with("tisb") => SourceKind::Tisb,
            "uat" | "uat978" => SourceKind::Uat,
            "adsc" => SourceKind::Adsc,
            "mlat" => SourceKind::Mlat,
            "flarm" => SourceKind::Flarm,
            "mode_s" | "modes" => SourceKind::ModeS,
            "aggregator" | "opensky" | "asterix" => SourceKind::Aggregator,
            "predicted" | "estimated" | "extrapolated" => SourceKind::Predicted,
            _ => SourceKind::Unknown,
        }
    }

    pub fn default_priority(self) -> i32 {
        PRIORITY_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, _, score)| *score)
            .unwrap_or(LOWEST_PRIORITY)
    }

    pub fn as_str(self) -> &'static str {
        PRIORITY_TABLE
            .iter()
            .find(|(kind, _, _)| *kind == self)
            .map(|(_, name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn is_predicted(self) -> bool {
        self == SourceKind::Predicted
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readsb_type_names() {
        assert_eq!(SourceKind::from_name("adsb_icao"), SourceKind::Adsb);
        assert_eq!(SourceKind::from_name("ADSB_ICAO_NT"), SourceKind::Adsb);
        assert_eq!(SourceKind::from_name("tisb_trackfile"), SourceKind::Tisb);
        assert_eq!(SourceKind::from_name("mode-s"), SourceKind::ModeS);
        assert_eq!(SourceKind::from_name("carrier pigeon"), SourceKind::Unknown);
    }

    #[test]
    fn test_table_is_strictly_ordered() {
        let scores: Vec<i32> = PRIORITY_TABLE.iter().map(|(_, _, s)| *s).collect();
        assert!(scores.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(SourceKind::Unknown.default_priority(), LOWEST_PRIORITY);
    }
}
