//! Unit recognition and linear conversion between compatible units.
//!
//! Laboratory units are grouped into physical-quantity families. Two units
//! pool together only when they belong to the same family, in which case a
//! linear conversion factor between them is defined. Units outside the table
//! are unrecognized and the owning variable is screened out rather than
//! mis-pooled.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

/// Numerator base of a concentration-style unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumeratorBase {
    /// Mass (g and SI-prefixed variants).
    Gram,
    /// Amount of substance (mol).
    Mole,
    /// International units of enzymatic activity.
    InternationalUnit,
    /// Generic activity units.
    ActivityUnit,
    /// Chemical equivalents.
    Equivalent,
    /// Catalytic activity (katal).
    Katal,
}

impl NumeratorBase {
    fn from_token(tok: &str) -> Option<Self> {
        match tok {
            "g" => Some(Self::Gram),
            "mol" => Some(Self::Mole),
            "iu" => Some(Self::InternationalUnit),
            "u" => Some(Self::ActivityUnit),
            "eq" => Some(Self::Equivalent),
            "kat" => Some(Self::Katal),
            _ => None,
        }
    }

    fn family_token(&self) -> &'static str {
        match self {
            Self::Gram => "g",
            Self::Mole => "mol",
            Self::InternationalUnit => "iu",
            Self::ActivityUnit => "u",
            Self::Equivalent => "eq",
            Self::Katal => "kat",
        }
    }
}

/// Parsed per-volume concentration unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSignature {
    /// Numerator base quantity.
    pub base: NumeratorBase,
    /// Scale of the numerator SI prefix (e.g. 1e-3 for milli).
    pub num_scale: f64,
    /// Scale of the volume denominator relative to one liter.
    pub den_scale: f64,
    /// Normalized unit string (lowercase, no whitespace).
    pub normalized: String,
}

impl UnitSignature {
    /// Amount of numerator base per liter represented by one unit.
    #[inline]
    pub fn density(&self) -> f64 {
        self.num_scale / self.den_scale
    }
}

/// A unit recognized by the compatibility table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitClass {
    /// Per-volume concentration with a parsed prefix/base/denominator.
    Concentration(UnitSignature),
    /// Standalone unit forming its own family (identity conversion only).
    Atomic(String),
}

impl UnitClass {
    /// Family key used for pooling. Units pool only within one family.
    pub fn family(&self) -> String {
        match self {
            UnitClass::Concentration(sig) => format!("{}/vol", sig.base.family_token()),
            UnitClass::Atomic(u) => format!("unit:{}", u),
        }
    }

    /// Normalized unit string.
    pub fn normalized(&self) -> &str {
        match self {
            UnitClass::Concentration(sig) => &sig.normalized,
            UnitClass::Atomic(u) => u,
        }
    }
}

/// Normalize a raw unit string: lowercase, fold micro signs, strip whitespace.
pub fn normalize_unit(unit: &str) -> String {
    unit.trim()
        .to_lowercase()
        .replace(['\u{03bc}', '\u{00b5}'], "u")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

fn signature_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([pnumcd]?)(g|mol|iu|u|eq|kat)/(l|dl|ml|ul)$").unwrap())
}

fn prefix_scale(prefix: &str) -> Option<f64> {
    match prefix {
        "" => Some(1.0),
        "p" => Some(1e-12),
        "n" => Some(1e-9),
        "u" => Some(1e-6),
        "m" => Some(1e-3),
        "c" => Some(1e-2),
        "d" => Some(1e-1),
        _ => None,
    }
}

fn denominator_scale(den: &str) -> Option<f64> {
    match den {
        "l" => Some(1.0),
        "dl" => Some(1e-1),
        "ml" => Some(1e-3),
        "ul" => Some(1e-6),
        _ => None,
    }
}

/// Lookup table of recognized units keyed by physical-quantity family.
///
/// Concentration units are recognized structurally (prefix x base x volume
/// denominator). Atomic units are an editable list of standalone units each
/// forming its own single-member family.
#[derive(Debug, Clone)]
pub struct UnitTable {
    atomic: HashSet<String>,
}

impl Default for UnitTable {
    fn default() -> Self {
        // Units seen on pooled NHANES lab variables that are not per-volume
        // concentrations. Each is its own family; no cross-conversion.
        let atomic = [
            "%",
            "ratio",
            "fl",
            "pg",
            "sec",
            "seconds",
            "mm/hr",
            "mosm/kg",
            "1000cells/ul",
            "millioncells/ul",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self { atomic }
    }
}

impl UnitTable {
    /// Add an atomic unit to the table. The unit is normalized first.
    pub fn with_atomic(mut self, unit: &str) -> Self {
        self.atomic.insert(normalize_unit(unit));
        self
    }

    /// Classify a raw unit string, or `None` when unrecognized.
    pub fn classify(&self, unit: &str) -> Option<UnitClass> {
        let norm = normalize_unit(unit);
        if norm.is_empty() {
            return None;
        }
        if let Some(caps) = signature_regex().captures(&norm) {
            let num_scale = prefix_scale(&caps[1])?;
            let base = NumeratorBase::from_token(&caps[2])?;
            let den_scale = denominator_scale(&caps[3])?;
            return Some(UnitClass::Concentration(UnitSignature {
                base,
                num_scale,
                den_scale,
                normalized: norm,
            }));
        }
        if self.atomic.contains(&norm) {
            return Some(UnitClass::Atomic(norm));
        }
        None
    }

    /// Family key for a unit, or `None` when unrecognized.
    pub fn family(&self, unit: &str) -> Option<String> {
        self.classify(unit).map(|c| c.family())
    }

    /// Linear factor converting a value in `src` to `dst`.
    ///
    /// `None` when either unit is unrecognized or the units belong to
    /// different families (no lossless linear conversion exists).
    pub fn conversion_factor(&self, src: &str, dst: &str) -> Option<f64> {
        let src = self.classify(src)?;
        let dst = self.classify(dst)?;
        match (src, dst) {
            (UnitClass::Concentration(s), UnitClass::Concentration(d)) => {
                if s.base != d.base {
                    return None;
                }
                let dst_density = d.density();
                if dst_density == 0.0 {
                    return None;
                }
                Some(s.density() / dst_density)
            }
            (UnitClass::Atomic(s), UnitClass::Atomic(d)) => {
                if s == d {
                    Some(1.0)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}
