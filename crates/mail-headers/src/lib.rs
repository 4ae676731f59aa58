//! Raw message header block, as consumed by an SMTP submission client.
//! Headers are kept in insertion order and names may repeat; no RFC 5322
//! syntax validation is performed on names or values.

/// A single raw header: a name and the value exactly as it should appear
/// on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Represents an ordered list of headers.
/// Note that there may be multiple headers with the same name.
/// Derefs to the underlying `Vec<Header>` for mutation,
/// but provides some accessors for retrieving headers by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    headers: Vec<Header>,
}

impl std::ops::Deref for HeaderMap {
    type Target = Vec<Header>;
    fn deref(&self) -> &Vec<Header> {
        &self.headers
    }
}

impl std::ops::DerefMut for HeaderMap {
    fn deref_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Iterate the headers with the given name, in insertion order.
    /// Name matching is case-insensitive.
    pub fn iter_named<'a, 'name>(
        &'a self,
        name: &'name str,
    ) -> impl DoubleEndedIterator<Item = &'a Header> + 'name
    where
        'a: 'name,
    {
        self.headers
            .iter()
            .filter(|header| header.name().eq_ignore_ascii_case(name))
    }

    pub fn get_first(&self, name: &str) -> Option<&Header> {
        self.iter_named(name).next()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.get_first(name).is_some()
    }

    /// All values carried by headers with the given name, in order.
    pub fn multi_value(&self, name: &str) -> Vec<String> {
        self.iter_named(name)
            .map(|header| header.value().to_string())
            .collect()
    }

    /// The complete header block, each header CRLF-terminated, followed
    /// by the blank-line separator that precedes a message body.
    pub fn generate_raw(&self) -> String {
        let mut raw = String::new();
        for header in &self.headers {
            raw.push_str(header.name());
            raw.push_str(": ");
            raw.push_str(header.value());
            raw.push_str("\r\n");
        }
        raw.push_str("\r\n");
        raw
    }
}
