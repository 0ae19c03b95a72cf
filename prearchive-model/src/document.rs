//! The rebuilt session document: the metadata tree describing one imaging
//! session's scans and their resources. Persisted as `session.json` inside
//! the session directory and re-parsed by the lifecycle operations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// DICOM-style modality code, including the combined acquisition types that
/// drive modality separation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    Mr,
    Pt,
    Ct,
    Us,
    Cr,
    Dx,
    Nm,
    PetMr,
    PetCt,
    Other(String),
}

impl Modality {
    pub fn as_str(&self) -> &str {
        match self {
            Modality::Mr => "MR",
            Modality::Pt => "PT",
            Modality::Ct => "CT",
            Modality::Us => "US",
            Modality::Cr => "CR",
            Modality::Dx => "DX",
            Modality::Nm => "NM",
            Modality::PetMr => "PETMR",
            Modality::PetCt => "PETCT",
            Modality::Other(code) => code,
        }
    }

    /// True for combined acquisition types that a project may split into
    /// per-modality sessions.
    pub fn is_combined(&self) -> bool {
        matches!(self, Modality::PetMr | Modality::PetCt)
    }

    /// The single-modality components of a combined type.
    pub fn split(&self) -> Vec<Modality> {
        match self {
            Modality::PetMr => vec![Modality::Pt, Modality::Mr],
            Modality::PetCt => vec![Modality::Pt, Modality::Ct],
            other => vec![other.clone()],
        }
    }

    /// Derive the session-level modality from the distinct scan modalities.
    /// PET paired with MR or CT folds into the combined type; anything else
    /// keeps the first modality seen.
    pub fn of_scans<'a>(scans: impl IntoIterator<Item = &'a Modality>) -> Option<Modality> {
        let mut seen: Vec<&Modality> = Vec::new();
        for m in scans {
            if !seen.contains(&m) {
                seen.push(m);
            }
        }
        let has = |m: &Modality| seen.contains(&m);
        if has(&Modality::Pt) && has(&Modality::Mr) {
            return Some(Modality::PetMr);
        }
        if has(&Modality::Pt) && has(&Modality::Ct) {
            return Some(Modality::PetCt);
        }
        seen.first().map(|m| (*m).clone())
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "MR" => Modality::Mr,
            "PT" | "PET" => Modality::Pt,
            "CT" => Modality::Ct,
            "US" => Modality::Us,
            "CR" => Modality::Cr,
            "DX" => Modality::Dx,
            "NM" => Modality::Nm,
            "PETMR" | "PET_MR" => Modality::PetMr,
            "PETCT" | "PET_CT" => Modality::PetCt,
            other => Modality::Other(other.to_string()),
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Modality {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Modality {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(code.parse().expect("modality parsing is infallible"))
    }
}

/// One resource attached to a scan. The explicit kind discriminant is what
/// the merge engine switches on when resources of different kinds collide.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum Resource {
    /// Catalog-backed resource: a manifest file lists the members.
    Catalog {
        label: String,
        /// Absolute directory the catalog's entry uris resolve against.
        /// Rewritten when the session moves into the archive.
        #[cfg_attr(feature = "serde", serde(default))]
        root: Option<String>,
        /// Path of the catalog file, relative to the session directory.
        catalog_path: String,
        file_count: u64,
        total_size: u64,
    },
    /// A single named file.
    SingleFile {
        label: String,
        file_name: String,
        size: u64,
    },
    /// Members matched by a glob-style pattern at read time.
    Pattern { label: String, pattern: String },
}

impl Resource {
    pub fn label(&self) -> &str {
        match self {
            Resource::Catalog { label, .. }
            | Resource::SingleFile { label, .. }
            | Resource::Pattern { label, .. } => label,
        }
    }

    pub fn set_label(&mut self, new_label: impl Into<String>) {
        match self {
            Resource::Catalog { label, .. }
            | Resource::SingleFile { label, .. }
            | Resource::Pattern { label, .. } => *label = new_label.into(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Resource::Catalog { .. } => "catalog",
            Resource::SingleFile { .. } => "single_file",
            Resource::Pattern { .. } => "pattern",
        }
    }
}

/// One scan (series) within a session.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scan {
    pub id: String,
    pub modality: Modality,
    #[cfg_attr(feature = "serde", serde(default))]
    pub series_description: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub resources: Vec<Resource>,
}

impl Scan {
    pub fn resource(&self, label: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.label() == label)
    }

    pub fn resource_mut(&mut self, label: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.label() == label)
    }
}

/// The rebuilt metadata document for a session.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionDocument {
    pub id: String,
    pub label: String,
    pub modality: Modality,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scans: Vec<Scan>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub notes: Option<String>,
    /// Opaque key/value metadata carried alongside the structured tree.
    #[cfg_attr(feature = "serde", serde(default))]
    pub fields: BTreeMap<String, String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub prevent_anonymization: bool,
}

impl SessionDocument {
    pub fn new(id: impl Into<String>, label: impl Into<String>, modality: Modality) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            modality,
            scans: Vec::new(),
            description: None,
            notes: None,
            fields: BTreeMap::new(),
            prevent_anonymization: false,
        }
    }

    pub fn scan(&self, id: &str) -> Option<&Scan> {
        self.scans.iter().find(|s| s.id == id)
    }

    pub fn scan_mut(&mut self, id: &str) -> Option<&mut Scan> {
        self.scans.iter_mut().find(|s| s.id == id)
    }

    /// Distinct modalities across the document's scans.
    pub fn scan_modalities(&self) -> Vec<Modality> {
        let mut out: Vec<Modality> = Vec::new();
        for scan in &self.scans {
            if !out.contains(&scan.modality) {
                out.push(scan.modality.clone());
            }
        }
        out
    }
}
