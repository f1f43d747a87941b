use crate::errors::ConfigError;

/// A single name/value pair as sent or received on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    name: String,
    value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Immutable, case-insensitive header multimap.
///
/// Entries keep their insertion order and repeated names keep every value,
/// so `get_all("set-cookie")` returns values in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<HttpHeader>,
}

impl Headers {
    #[must_use]
    pub fn builder() -> HeadersBuilder {
        HeadersBuilder::default()
    }

    /// Wraps headers decoded from the wire; they were already validated by
    /// the decoder.
    pub(crate) fn from_entries(entries: Vec<HttpHeader>) -> Self {
        Self { entries }
    }

    /// First value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.is(name))
            .map(HttpHeader::value)
    }

    /// Every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |h| h.is(name))
            .map(HttpHeader::value)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.is(name))
    }

    /// True when any comma separated element of any `name` value equals
    /// `token`, ignoring case.
    #[must_use]
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HttpHeader> {
        self.entries.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[HttpHeader] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a HttpHeader;
    type IntoIter = std::slice::Iter<'a, HttpHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Accumulates headers and validates them once on [`HeadersBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct HeadersBuilder {
    entries: Vec<HttpHeader>,
}

impl HeadersBuilder {
    #[must_use]
    pub fn add(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push(HttpHeader::new(name, value));
        self
    }

    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(HttpHeader::new(name, value));
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|h| h.is(name))
    }

    /// # Errors
    ///
    /// [`ConfigError::InvalidHeader`] for an empty name, a name with
    /// non-token characters, or a value containing CR/LF.
    pub fn build(self) -> Result<Headers, ConfigError> {
        for header in &self.entries {
            validate(header)?;
        }
        Ok(Headers {
            entries: self.entries,
        })
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn validate(header: &HttpHeader) -> Result<(), ConfigError> {
    if header.name.is_empty() {
        return Err(ConfigError::InvalidHeader("empty header name".into()));
    }
    if !header.name.bytes().all(is_token_byte) {
        return Err(ConfigError::InvalidHeader(format!(
            "illegal character in header name {:?}",
            header.name
        )));
    }
    if header.value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(ConfigError::InvalidHeader(format!(
            "illegal character in value of {}",
            header.name
        )));
    }
    Ok(())
}
