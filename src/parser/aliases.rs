use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::db::models::{Pro, UnknownVariant};

/// Logical fields of a royalty record that are read from statement columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Isrc,
    Title,
    Artist,
    Amount,
    Period,
    Plays,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::Isrc, Field::Title, Field::Artist, Field::Amount, Field::Period, Field::Plays,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Isrc => "isrc",
            Self::Title => "title",
            Self::Artist => "artist",
            Self::Amount => "amount",
            Self::Period => "period",
            Self::Plays => "plays",
        }
    }

    /// Built-in column names, highest priority first.
    fn default_aliases(&self) -> &'static [&'static str] {
        match self {
            Self::Isrc => &["ISRC", "isrc"],
            Self::Title => &["Title", "Song Title", "track_title"],
            Self::Artist => &["Artist", "Writer", "artist_name"],
            Self::Amount => &["Amount", "Royalty", "earnings"],
            Self::Period => &["Period", "Statement Period"],
            Self::Plays => &["Plays", "Streams"],
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Field {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Field::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| UnknownVariant { kind: "field", value: s.to_string() })
    }
}

/// Ordered column-name candidates per field.
///
/// Lookup order for a row from a given PRO: that PRO's own aliases (in the
/// order they were added), then the shared list (built-ins first, then
/// extras). The first column present with a non-blank value wins.
#[derive(Debug, Clone)]
pub struct AliasTable {
    shared: HashMap<Field, Vec<String>>,
    per_pro: HashMap<(Pro, Field), Vec<String>>,
}

impl Default for AliasTable {
    fn default() -> Self {
        let shared = Field::ALL
            .into_iter()
            .map(|f| (f, f.default_aliases().iter().map(|s| s.to_string()).collect()))
            .collect();
        Self { shared, per_pro: HashMap::new() }
    }
}

impl AliasTable {
    /// Register extra column names for `field`. With `pro` set, the names only
    /// apply to that PRO's statements and take priority over the shared list.
    pub fn add<I, S>(&mut self, field: Field, names: I, pro: Option<Pro>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = match pro {
            Some(pro) => self.per_pro.entry((pro, field)).or_default(),
            None => self.shared.entry(field).or_default(),
        };
        for name in names {
            let name = name.into();
            if !list.contains(&name) {
                list.push(name);
            }
        }
    }

    /// Column names consulted for `field` on a `pro` statement, in priority order.
    pub fn candidates(&self, field: Field, pro: Pro) -> impl Iterator<Item = &str> {
        self.per_pro
            .get(&(pro, field))
            .into_iter()
            .flatten()
            .chain(self.shared.get(&field).into_iter().flatten())
            .map(String::as_str)
    }

    /// The trimmed value of the first candidate column present and non-blank.
    pub fn lookup<'r>(&self, row: &'r BTreeMap<String, String>, field: Field, pro: Pro) -> Option<&'r str> {
        self.candidates(field, pro)
            .filter_map(|name| row.get(name))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_first_alias_wins() {
        let table = AliasTable::default();
        let r = row(&[("track_title", "Third"), ("Song Title", "Second"), ("Title", "First")]);
        assert_eq!(table.lookup(&r, Field::Title, Pro::Ascap), Some("First"));

        let r = row(&[("track_title", "Third"), ("Song Title", "Second")]);
        assert_eq!(table.lookup(&r, Field::Title, Pro::Ascap), Some("Second"));
    }

    #[test]
    fn test_blank_value_falls_through() {
        let table = AliasTable::default();
        let r = row(&[("Amount", "  "), ("Royalty", "12.00")]);
        assert_eq!(table.lookup(&r, Field::Amount, Pro::Bmi), Some("12.00"));
        assert_eq!(table.lookup(&row(&[]), Field::Amount, Pro::Bmi), None);
    }

    #[test]
    fn test_pro_specific_aliases_take_priority() {
        let mut table = AliasTable::default();
        table.add(Field::Title, ["Work Title"], Some(Pro::Bmi));
        table.add(Field::Title, ["Composition"], None);

        let r = row(&[("Title", "Generic"), ("Work Title", "BMI Specific")]);
        assert_eq!(table.lookup(&r, Field::Title, Pro::Bmi), Some("BMI Specific"));
        assert_eq!(table.lookup(&r, Field::Title, Pro::Ascap), Some("Generic"));

        let r = row(&[("Composition", "Extra")]);
        assert_eq!(table.lookup(&r, Field::Title, Pro::Prs), Some("Extra"));

        let names: Vec<&str> = table.candidates(Field::Title, Pro::Bmi).collect();
        assert_eq!(names, vec!["Work Title", "Title", "Song Title", "track_title", "Composition"]);
    }

    #[test]
    fn test_add_ignores_duplicates() {
        let mut table = AliasTable::default();
        table.add(Field::Amount, ["Amount", "Net"], None);
        assert_eq!(table.candidates(Field::Amount, Pro::Other).count(), 4);
    }

    #[test]
    fn test_field_from_str() {
        assert_eq!(" Title ".parse::<Field>().unwrap(), Field::Title);
        assert!("currency".parse::<Field>().is_err());
    }
}
