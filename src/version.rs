//! Loose dotted version values
//!
//! Versions in audio content manifests are not semver: they show up as
//! strings ("2.0.1"), integers (`2`) or reals (`1.5`), and some contain
//! letters. Parsing never fails; anything missing or empty becomes the
//! `0.0.0` sentinel, which orders below every real version.

use std::cmp::Ordering;
use std::fmt;

/// A single version component
#[derive(Debug, Clone, PartialEq, Eq)]
enum Component {
    Num(u64),
    Text(String),
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Num(a), Component::Num(b)) => a.cmp(b),
            (Component::Text(a), Component::Text(b)) => a.cmp(b),
            // Numbers order before text at the same position
            (Component::Num(_), Component::Text(_)) => Ordering::Less,
            (Component::Text(_), Component::Num(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A loosely ordered dotted version
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    components: Vec<Component>,
}

impl Version {
    /// The `0.0.0` sentinel used for anything missing
    pub fn sentinel() -> Self {
        Self::parse("0.0.0")
    }

    /// Parse a version string; never fails
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::sentinel();
        }

        let mut components = Vec::new();
        let mut current = String::new();

        let flush = |current: &mut String, components: &mut Vec<Component>| {
            if current.is_empty() {
                return;
            }
            let component = match current.parse::<u64>() {
                Ok(n) => Component::Num(n),
                Err(_) => Component::Text(current.clone()),
            };
            components.push(component);
            current.clear();
        };

        for c in raw.chars() {
            if c.is_ascii_digit() {
                if current.chars().next().is_some_and(|p| !p.is_ascii_digit()) {
                    flush(&mut current, &mut components);
                }
                current.push(c);
            } else if c.is_alphabetic() {
                if current.chars().next().is_some_and(|p| p.is_ascii_digit()) {
                    flush(&mut current, &mut components);
                }
                current.push(c);
            } else {
                flush(&mut current, &mut components);
            }
        }
        flush(&mut current, &mut components);

        if components.is_empty() {
            return Self::sentinel();
        }

        Self {
            raw: raw.to_string(),
            components,
        }
    }

    /// Build from an integer manifest value
    pub fn from_int(value: i64) -> Self {
        Self::parse(&value.to_string())
    }

    /// Build from a real manifest value
    pub fn from_real(value: f64) -> Self {
        if value.is_finite() {
            Self::parse(&value.to_string())
        } else {
            Self::sentinel()
        }
    }

    /// True when this is the `0.0.0` sentinel
    pub fn is_sentinel(&self) -> bool {
        self.components.iter().all(|c| *c == Component::Num(0))
    }

}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        let zero = Component::Num(0);
        for i in 0..len {
            let a = self.components.get(i).unwrap_or(&zero);
            let b = other.components.get(i).unwrap_or(&zero);
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Default for Version {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl From<&str> for Version {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}
