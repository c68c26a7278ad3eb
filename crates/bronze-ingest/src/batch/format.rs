use bronze_common::BronzeError;
use std::fmt;
use std::str::FromStr;

/// Source file formats the converter can read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
    Parquet,
}

impl FileFormat {
    /// Lowercase file-name extension, without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
            FileFormat::Parquet => "parquet",
        }
    }

    /// Whether `key` names a file of this format.
    ///
    /// Only the suffix is checked, exactly as written in the key.
    pub fn matches(&self, key: &str) -> bool {
        key.ends_with(&format!(".{}", self.extension()))
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for FileFormat {
    type Err = BronzeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "json" => Ok(FileFormat::Json),
            "parquet" => Ok(FileFormat::Parquet),
            _ => Err(BronzeError::UnsupportedFormat(s.to_string())),
        }
    }
}
