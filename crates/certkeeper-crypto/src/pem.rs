//! PEM text helpers for certificate chains

const BEGIN_CERT: &str = "-----BEGIN CERTIFICATE-----";
const END_CERT: &str = "-----END CERTIFICATE-----";

/// Split a PEM chain into its individual certificate blocks, each returned
/// with its BEGIN/END markers and a trailing newline. Text outside the
/// markers is discarded.
pub fn split_certs(chain_pem: &str) -> Vec<String> {
    let mut certs = Vec::new();
    let mut rest = chain_pem;

    while let Some(start) = rest.find(BEGIN_CERT) {
        let Some(end) = rest[start..].find(END_CERT) else {
            break;
        };
        let block_end = start + end + END_CERT.len();
        let mut block = rest[start..block_end].to_string();
        block.push('\n');
        certs.push(block);
        rest = &rest[block_end..];
    }

    certs
}

/// The first (leaf) certificate of a chain
pub fn leaf(chain_pem: &str) -> Option<String> {
    split_certs(chain_pem).into_iter().next()
}

/// The chain with the leaf removed (issuer chain only). Returns `None` when
/// the input holds fewer than two certificates.
pub fn chain_without_leaf(chain_pem: &str) -> Option<String> {
    let certs = split_certs(chain_pem);
    if certs.len() < 2 {
        return None;
    }
    Some(certs[1..].concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nBBBB\n-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\nCCCC\n-----END CERTIFICATE-----\n";

    #[test]
    fn test_split_certs() {
        let certs = split_certs(CHAIN);
        assert_eq!(certs.len(), 3);
        assert!(certs[0].contains("AAAA"));
        assert!(certs[2].contains("CCCC"));
        for cert in &certs {
            assert!(cert.starts_with(BEGIN_CERT));
            assert!(cert.ends_with("-----END CERTIFICATE-----\n"));
        }
    }

    #[test]
    fn test_leaf() {
        let leaf = leaf(CHAIN).unwrap();
        assert!(leaf.contains("AAAA"));
        assert!(!leaf.contains("BBBB"));
    }

    #[test]
    fn test_chain_without_leaf() {
        let rest = chain_without_leaf(CHAIN).unwrap();
        assert!(!rest.contains("AAAA"));
        assert!(rest.contains("BBBB"));
        assert!(rest.contains("CCCC"));
    }

    #[test]
    fn test_chain_without_leaf_single_cert() {
        let single = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(chain_without_leaf(single).is_none());
    }

    #[test]
    fn test_split_ignores_surrounding_text() {
        let wrapped = format!("some garbage\n{CHAIN}\ntrailing");
        assert_eq!(split_certs(&wrapped).len(), 3);
    }

    #[test]
    fn test_split_empty() {
        assert!(split_certs("").is_empty());
        assert!(leaf("").is_none());
    }
}
