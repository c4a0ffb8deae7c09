/// The four power flows tracked for every measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Production,
    Import,
    Export,
    Consumption,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Production,
        Field::Import,
        Field::Export,
        Field::Consumption,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Field::Production => "production",
            Field::Import => "import",
            Field::Export => "export",
            Field::Consumption => "consumption",
        }
    }
}

/// One fused sample: meter net power combined with the latest inverter
/// production.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Measurement {
    /// Energy meter clock in seconds.
    pub timestamp: f64,
    pub import: f64,
    pub export: f64,
    pub production: f64,
    pub consumption: f64,
}

impl Measurement {
    /// Splits the signed net grid power into import and export.
    pub fn from_net(timestamp: f64, net_watts: f64, production: f64) -> Self {
        let import = net_watts.max(0.0);
        let export = (-net_watts).max(0.0);
        Self {
            timestamp,
            import,
            export,
            production,
            consumption: import + production - export,
        }
    }

    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::Production => self.production,
            Field::Import => self.import,
            Field::Export => self.export,
            Field::Consumption => self.consumption,
        }
    }

    pub fn self_sufficiency(&self) -> f64 {
        self_sufficiency(self.production, self.import, self.export, self.consumption)
    }
}

/// Percentage of consumption covered by local production.
///
/// -100 while nothing is produced. Capped at 99 while any power is imported
/// and at 1000 otherwise.
pub fn self_sufficiency(production: f64, import: f64, export: f64, consumption: f64) -> f64 {
    if production == 0.0 {
        -100.0
    } else if import > 0.0 {
        ((production - export) / consumption * 100.0).min(99.0)
    } else {
        (production / consumption * 100.0).min(1000.0)
    }
}
