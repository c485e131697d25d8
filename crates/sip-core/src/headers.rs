use std::slice::Iter;

use smol_str::SmolStr;

/// Compact header forms (RFC 3261 §7.3.3) the transaction layer looks up.
const COMPACT_FORMS: [(&str, &str); 7] = [
    ("Via", "v"),
    ("From", "f"),
    ("To", "t"),
    ("Call-ID", "i"),
    ("Contact", "m"),
    ("Content-Length", "l"),
    ("Supported", "k"),
];

fn names_match(stored: &str, wanted: &str) -> bool {
    if stored.eq_ignore_ascii_case(wanted) {
        return true;
    }
    COMPACT_FORMS.iter().any(|(long, short)| {
        (long.eq_ignore_ascii_case(wanted) && stored.eq_ignore_ascii_case(short))
            || (short.eq_ignore_ascii_case(wanted) && stored.eq_ignore_ascii_case(long))
    })
}

/// A single SIP header field as a name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: SmolStr,
    pub value: SmolStr,
}

/// Ordered header collection; lookups ignore case and accept compact forms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header to the collection.
    pub fn push(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        self.0.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Inserts a header in front of every other header of the same name,
    /// or at the top of the list when none exists yet.
    pub fn push_front(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        let name = name.into();
        let index = self
            .0
            .iter()
            .position(|h| names_match(&h.name, &name))
            .unwrap_or(0);
        self.0.insert(
            index,
            Header {
                name,
                value: value.into(),
            },
        );
    }

    /// Replaces the first header with this name, appending when absent.
    pub fn set(&mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|h| names_match(&h.name, &name)) {
            Some(header) => header.value = value,
            None => self.0.push(Header { name, value }),
        }
    }

    /// Removes every header with this name, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|h| !names_match(&h.name, name));
        before - self.0.len()
    }

    pub fn iter(&self) -> Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the first header whose name matches.
    pub fn get(&self, name: &str) -> Option<&SmolStr> {
        self.0
            .iter()
            .find(|h| names_match(&h.name, name))
            .map(|h| &h.value)
    }

    /// Mutable access to the first header value with this name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut SmolStr> {
        self.0
            .iter_mut()
            .find(|h| names_match(&h.name, name))
            .map(|h| &mut h.value)
    }

    /// Returns all values for the given name, preserving order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SmolStr> + 'a {
        self.0
            .iter()
            .filter(move |h| names_match(&h.name, name))
            .map(|h| &h.value)
    }

    /// Returns true when at least one header with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
