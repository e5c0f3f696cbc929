//! FEAT capability parsing and storage (RFC 2389)
//!
//! The FEAT command returns a list of extensions supported by the server.
//! Each line is a capability name optionally followed by arguments; the
//! `HASH` capability additionally carries a `;`-delimited algorithm list.

use std::collections::HashMap;

/// Hash algorithms a server may advertise via the `HASH` FEAT line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha512,
    Md5,
    Crc32,
}

impl HashAlgorithm {
    fn parse(token: &str) -> Option<Self> {
        match token.trim_end_matches('*').to_ascii_uppercase().as_str() {
            "SHA-1" => Some(Self::Sha1),
            "SHA-256" => Some(Self::Sha256),
            "SHA-512" => Some(Self::Sha512),
            "MD5" => Some(Self::Md5),
            "CRC" | "CRC32" => Some(Self::Crc32),
            _ => None,
        }
    }
}

/// Server feature set discovered via `FEAT`.
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Vec<String>>,
    hash_algorithms: Vec<HashAlgorithm>,
    default_hash_algorithm: Option<HashAlgorithm>,
}

impl CapabilityRegistry {
    /// An empty registry, as used before `FEAT` has been issued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the body of a `FEAT` reply (its `info_messages`, one feature
    /// per line, leading whitespace and case ignored).
    pub fn parse(body: &str) -> Self {
        let mut capabilities = HashMap::new();
        let mut hash_algorithms = Vec::new();
        let mut default_hash_algorithm = None;

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let name = parts[0].to_uppercase();

            if name == "HASH" {
                for token in parts.get(1).copied().unwrap_or("").split(';') {
                    let token = token.trim();
                    if token.is_empty() {
                        continue;
                    }
                    if let Some(algo) = HashAlgorithm::parse(token) {
                        if token.ends_with('*') {
                            default_hash_algorithm = Some(algo);
                        }
                        hash_algorithms.push(algo);
                    }
                }
            }

            let args: Vec<String> = parts[1..].iter().map(|s| s.to_string()).collect();
            capabilities.insert(name, args);
        }

        Self {
            capabilities,
            hash_algorithms,
            default_hash_algorithm,
        }
    }

    /// Whether the server advertised the named capability (e.g. `"UTF8"`,
    /// `"MLST"`, `"SIZE"`).
    pub fn has(&self, capability: &str) -> bool {
        self.capabilities.contains_key(&capability.to_uppercase())
    }

    /// Arguments following a capability's name, e.g. `REST` -> `["STREAM"]`.
    pub fn get_args(&self, capability: &str) -> Option<&Vec<String>> {
        self.capabilities.get(&capability.to_uppercase())
    }

    /// All capability names the server advertised.
    pub fn list(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// Hash algorithms advertised via the `HASH` feature line.
    pub fn hash_algorithms(&self) -> &[HashAlgorithm] {
        &self.hash_algorithms
    }

    /// The algorithm marked with `*` in the `HASH` feature line, if any.
    pub fn default_hash_algorithm(&self) -> Option<HashAlgorithm> {
        self.default_hash_algorithm
    }
}
