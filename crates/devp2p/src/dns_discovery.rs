//! EIP-1459 node lists served over DNS.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use data_encoding::BASE32_NOPAD;
use hickory_resolver::TokioResolver;
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use rand::seq::SliceRandom;
use sha3::{Digest, Keccak256};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::discovery::NodeSource;
use crate::enr::NodeRecord;
use crate::error::Error;

/// How often a tree is crawled again after a full pass.
pub const DNS_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// A parsed `enrtree://<key>@<domain>` location.
#[derive(Debug, Clone)]
pub struct TreeUrl {
    pub signer: VerifyingKey,
    pub domain: String,
}

impl TreeUrl {
    pub fn parse(url: &str) -> Result<Self, Error> {
        let bad = |what: String| Error::Dns(format!("bad tree URL {}: {}", url, what));
        let (key, domain) = url
            .strip_prefix("enrtree://")
            .and_then(|rest| rest.split_once('@'))
            .ok_or_else(|| bad("expected enrtree://<key>@<domain>".to_string()))?;
        if domain.is_empty() {
            return Err(bad("empty domain".to_string()));
        }
        let key = BASE32_NOPAD
            .decode(key.as_bytes())
            .map_err(|e| bad(format!("key is not base32: {}", e)))?;
        if key.len() != 33 {
            return Err(bad(format!("key is {} bytes, want 33", key.len())));
        }
        let signer = VerifyingKey::from_sec1_bytes(&key).map_err(|e| bad(e.to_string()))?;
        Ok(Self {
            signer,
            domain: domain.to_string(),
        })
    }
}

/// One TXT record of a node tree.
#[derive(Debug)]
enum TreeEntry {
    Root { enr_root: String, signature: Vec<u8> },
    Branch(Vec<String>),
    Leaf(NodeRecord),
    /// Links to other trees are not followed.
    Link,
}

impl TreeEntry {
    fn parse(txt: &str) -> Result<Self, Error> {
        if let Some(fields) = txt.strip_prefix("enrtree-root:v1 ") {
            let mut enr_root = None;
            let mut signature = None;
            for field in fields.split_whitespace() {
                match field.split_once('=') {
                    Some(("e", value)) => enr_root = Some(value.to_string()),
                    Some(("sig", value)) => {
                        signature = Some(
                            URL_SAFE_NO_PAD
                                .decode(value)
                                .map_err(|e| Error::Dns(format!("root signature: {}", e)))?,
                        )
                    }
                    _ => {}
                }
            }
            return match (enr_root, signature) {
                (Some(enr_root), Some(signature)) => Ok(TreeEntry::Root { enr_root, signature }),
                _ => Err(Error::Dns("root record lacks e= or sig=".to_string())),
            };
        }
        if let Some(children) = txt.strip_prefix("enrtree-branch:") {
            return Ok(TreeEntry::Branch(
                children
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect(),
            ));
        }
        if txt.starts_with("enrtree://") {
            return Ok(TreeEntry::Link);
        }
        if txt.starts_with("enr:") {
            return NodeRecord::from_text(txt).map(TreeEntry::Leaf);
        }
        Err(Error::Dns(format!("unknown tree entry {:.16}", txt)))
    }
}

/// Checks the root signature: keccak256 of the text before ` sig=`,
/// signed by the tree key.
fn verify_root(txt: &str, signature: &[u8], signer: &VerifyingKey) -> Result<(), Error> {
    let (signed, _) = txt
        .split_once(" sig=")
        .ok_or_else(|| Error::Dns("root record lacks sig=".to_string()))?;
    if signature.len() != 65 {
        return Err(Error::Dns(format!("root signature is {} bytes, want 65", signature.len())));
    }
    let sig = Signature::from_slice(&signature[..64]).map_err(|e| Error::Dns(e.to_string()))?;
    let recovery = RecoveryId::try_from(signature[64] % 4).map_err(|e| Error::Dns(e.to_string()))?;
    let digest = Keccak256::digest(signed.as_bytes());
    let recovered =
        VerifyingKey::recover_from_prehash(&digest, &sig, recovery).map_err(|e| Error::Dns(e.to_string()))?;
    if recovered != *signer {
        return Err(Error::Dns("root not signed by tree key".to_string()));
    }
    Ok(())
}

/// Crawls one DNS node tree and feeds its records to a [`SourceMix`](crate::discovery::SourceMix).
pub struct DnsDiscovery {
    resolver: TokioResolver,
    url: String,
    tree: TreeUrl,
}

impl DnsDiscovery {
    pub fn new(url: &str) -> Result<Self, Error> {
        let tree = TreeUrl::parse(url)?;
        let resolver = TokioResolver::builder_tokio()
            .map_err(|e| Error::Dns(format!("failed to create resolver: {}", e)))?
            .build();
        Ok(Self {
            resolver,
            url: url.to_string(),
            tree,
        })
    }

    /// Resolves the whole tree, in random order.
    pub async fn discover_nodes(&self) -> Result<Vec<NodeRecord>, Error> {
        let txt = self.query_txt(&self.tree.domain).await?;
        let TreeEntry::Root { enr_root, signature } = TreeEntry::parse(&txt)? else {
            return Err(Error::Dns(format!("{} is not a tree root", self.tree.domain)));
        };
        verify_root(&txt, &signature, &self.tree.signer)?;

        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        let mut pending = vec![enr_root];
        while let Some(hash) = pending.pop() {
            if !seen.insert(hash.clone()) {
                continue;
            }
            let name = format!("{}.{}", hash, self.tree.domain);
            let entry = match self.query_txt(&name).await.and_then(|txt| TreeEntry::parse(&txt)) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(name = %name, err = %e, "skipping tree entry");
                    continue;
                }
            };
            match entry {
                TreeEntry::Branch(children) => {
                    pending.extend(children.into_iter().filter(|c| !seen.contains(c)))
                }
                TreeEntry::Leaf(node) => nodes.push(node),
                TreeEntry::Root { .. } | TreeEntry::Link => {}
            }
        }
        nodes.shuffle(&mut rand::thread_rng());
        Ok(nodes)
    }

    async fn query_txt(&self, name: &str) -> Result<String, Error> {
        let response = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| Error::Dns(format!("TXT lookup {}: {}", name, e)))?;
        let txt: String = response
            .iter()
            .flat_map(|record| record.txt_data().iter())
            .filter_map(|data| std::str::from_utf8(data).ok())
            .collect();
        if txt.is_empty() {
            return Err(Error::Dns(format!("empty TXT record for {}", name)));
        }
        Ok(txt)
    }
}

#[async_trait]
impl NodeSource for DnsDiscovery {
    fn name(&self) -> &str {
        &self.url
    }

    async fn run(self: Box<Self>, out: mpsc::Sender<NodeRecord>) {
        let mut timer = interval(DNS_REFRESH_INTERVAL);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = out.closed() => return,
            }

            match self.discover_nodes().await {
                Ok(nodes) => {
                    info!(tree = %self.tree.domain, count = nodes.len(), "DNS tree crawled");
                    for node in nodes.into_iter().filter(|n| n.tcp_addr().is_some()) {
                        if out.send(node).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(tree = %self.tree.domain, err = %e, "DNS discovery failed"),
            }
        }
    }
}
