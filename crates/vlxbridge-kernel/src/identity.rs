//! Device identity normalization and the identity table.
//!
//! Every gateway node gets a bus-safe identity derived from its
//! human-readable name.  [`normalize`] is pure and total; the
//! [`IdentityTable`] is where uniqueness is enforced, so two devices whose
//! names fold to the same identity are reported instead of silently sharing
//! topics.

use std::collections::HashMap;

use tracing::warn;
use vlxbridge_types::BridgeError;

/// Result of normalizing a device name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    /// Identity composed only of `[a-z0-9-]`.
    pub identity: String,
    /// Characters that had no ASCII representation and were dropped.
    pub dropped: Vec<char>,
}

/// Normalize a device name into a bus-safe identity.
///
/// Steps: trim, lowercase, collapse each whitespace run into one hyphen,
/// transliterate known accented letters (`ä` → `ae`, `ß` → `ss`, …) and drop
/// anything still outside `[a-z0-9-]`.  The output is a fixed point:
/// `normalize(&normalize(s)) == normalize(s)`.
///
/// ```
/// use vlxbridge_kernel::identity::normalize;
///
/// assert_eq!(normalize("Küche Fenster"), "kueche-fenster");
/// assert_eq!(normalize("  Bad   Links "), "bad-links");
/// ```
pub fn normalize(name: &str) -> String {
    normalize_detailed(name).identity
}

/// Like [`normalize`], but also reports which characters were dropped.
pub fn normalize_detailed(name: &str) -> Normalized {
    let mut identity = String::with_capacity(name.len());
    let mut dropped = Vec::new();
    let mut in_whitespace = false;

    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            if !in_whitespace {
                identity.push('-');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;

        if matches!(c, 'a'..='z' | '0'..='9' | '-') {
            identity.push(c);
        } else if let Some(ascii) = transliterate(c) {
            identity.push_str(ascii);
        } else {
            dropped.push(c);
        }
    }

    Normalized { identity, dropped }
}

fn transliterate(c: char) -> Option<&'static str> {
    let ascii = match c {
        'ä' | 'æ' => "ae",
        'ö' | 'ø' | 'œ' => "oe",
        'ü' => "ue",
        'ß' => "ss",
        'å' => "aa",
        'à' | 'á' | 'â' | 'ã' => "a",
        'ç' => "c",
        'è' | 'é' | 'ê' | 'ë' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ñ' => "n",
        'ò' | 'ó' | 'ô' | 'õ' => "o",
        'ù' | 'ú' | 'û' => "u",
        'ý' | 'ÿ' => "y",
        _ => return None,
    };
    Some(ascii)
}

/// Tracks which device name owns each identity.
///
/// # Example
///
/// ```
/// use vlxbridge_kernel::identity::IdentityTable;
/// use vlxbridge_types::BridgeError;
///
/// let mut table = IdentityTable::new(true);
/// assert_eq!(table.claim("Küche").unwrap(), "kueche");
/// assert!(matches!(
///     table.claim("Kueche"),
///     Err(BridgeError::IdentityCollision { .. })
/// ));
/// ```
#[derive(Debug, Default)]
pub struct IdentityTable {
    owners: HashMap<String, String>,
    strict: bool,
}

impl IdentityTable {
    /// Create an empty table.
    ///
    /// In `strict` mode a name containing characters that cannot be
    /// represented is rejected; otherwise those characters are dropped with
    /// a warning.
    pub fn new(strict: bool) -> Self {
        Self {
            owners: HashMap::new(),
            strict,
        }
    }

    /// Derive the identity for `name` and reserve it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::InvalidIdentity`] when the name normalizes to
    ///   nothing, or contains unrepresentable characters in strict mode.
    /// - [`BridgeError::IdentityCollision`] when another device already
    ///   owns the identity.
    pub fn claim(&mut self, name: &str) -> Result<String, BridgeError> {
        let Normalized { identity, dropped } = normalize_detailed(name);

        if !dropped.is_empty() {
            if self.strict {
                return Err(BridgeError::InvalidIdentity {
                    name: name.to_string(),
                    reason: format!("unsupported characters {dropped:?}"),
                });
            }
            warn!(name, ?dropped, identity = %identity, "dropped characters from device identity");
        }

        if identity.trim_matches('-').is_empty() {
            return Err(BridgeError::InvalidIdentity {
                name: name.to_string(),
                reason: "name has no usable characters".to_string(),
            });
        }

        if let Some(first) = self.owners.get(&identity) {
            return Err(BridgeError::IdentityCollision {
                identity,
                first: first.clone(),
                second: name.to_string(),
            });
        }

        self.owners.insert(identity.clone(), name.to_string());
        Ok(identity)
    }

    /// Release an identity so it can be claimed again.
    pub fn release(&mut self, identity: &str) {
        self.owners.remove(identity);
    }

    /// Name of the device owning `identity`, if any.
    pub fn owner(&self, identity: &str) -> Option<&str> {
        self.owners.get(identity).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_hyphenates_whitespace_runs() {
        assert_eq!(normalize("Living Room\t Window"), "living-room-window");
        assert_eq!(normalize("Office"), "office");
    }

    #[test]
    fn transliterates_instead_of_dropping() {
        assert_eq!(normalize("Küche"), "kueche");
        assert_eq!(normalize("Schlafzimmer Süd"), "schlafzimmer-sued");
        assert_eq!(normalize("Großes Fenster"), "grosses-fenster");
        assert_eq!(normalize("ÖSTLICH"), "oestlich");
        assert_eq!(normalize("Café"), "cafe");
    }

    #[test]
    fn accented_names_do_not_collide_with_their_stripped_forms() {
        assert_ne!(normalize("Bär"), normalize("Bar"));
        assert_ne!(normalize("Tür"), normalize("Tr"));
    }

    #[test]
    fn drops_and_reports_unrepresentable_characters() {
        let n = normalize_detailed("Bad/WC #2");
        assert_eq!(n.identity, "badwc-2");
        assert_eq!(n.dropped, vec!['/', '#']);
    }

    #[test]
    fn normalization_is_idempotent() {
        let names = [
            "Küche Fenster",
            "  Bad   Links ",
            "Ärger+Ölß",
            "a - b",
            "Garage/Door 1",
            "ÆØÅ æøå",
            "😀 emoji room",
            "",
            "--",
            "Rollladen\nOst",
        ];
        for name in names {
            let once = normalize(name);
            assert_eq!(normalize(&once), once, "not idempotent for {name:?}");
            assert!(once.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-')));
        }
    }

    #[test]
    fn table_reports_collisions_for_folded_names() {
        let mut table = IdentityTable::new(true);
        table.claim("Küche").unwrap();
        let err = table.claim("KUECHE").unwrap_err();
        assert_eq!(
            err,
            BridgeError::IdentityCollision {
                identity: "kueche".into(),
                first: "Küche".into(),
                second: "KUECHE".into(),
            }
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.owner("kueche"), Some("Küche"));
    }

    #[test]
    fn duplicate_names_are_a_collision() {
        let mut table = IdentityTable::new(false);
        table.claim("Office").unwrap();
        assert!(matches!(
            table.claim("Office"),
            Err(BridgeError::IdentityCollision { .. })
        ));
    }

    #[test]
    fn strict_table_rejects_unrepresentable_characters() {
        let mut table = IdentityTable::new(true);
        assert!(matches!(
            table.claim("Bad/WC"),
            Err(BridgeError::InvalidIdentity { .. })
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn lenient_table_strips_unrepresentable_characters() {
        let mut table = IdentityTable::new(false);
        assert_eq!(table.claim("Bad/WC").unwrap(), "badwc");
    }

    #[test]
    fn empty_identity_is_rejected() {
        let mut table = IdentityTable::new(false);
        assert!(matches!(
            table.claim("   "),
            Err(BridgeError::InvalidIdentity { .. })
        ));
        assert!(matches!(
            table.claim("???"),
            Err(BridgeError::InvalidIdentity { .. })
        ));
    }

    #[test]
    fn release_frees_identity() {
        let mut table = IdentityTable::new(true);
        table.claim("Office").unwrap();
        table.release("office");
        assert!(table.claim("Office").is_ok());
    }
}
