//! In-process cloud backend implementing every remote collaborator.
//!
//! Block ciphertext lives in an OpenDAL memory operator; bookkeeping lives
//! behind one mutex that is never held across an await. Every call is
//! recorded with a timestamp, and faults (transient or 5xx PUT failures,
//! held PUTs, delays, quota exhaustion, corrupted blocks) can be injected.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use nimbus_core::types::{FileRecord, NodeId, RevisionId, ShareId, UploadingFileIdentifier};
use nimbus_core::{NimbusError, NimbusResult, ValidationError};
use nimbus_crypto::{derive_block_token, BlockToken};
use nimbus_storage::{memory_operator, BlockObjectStore};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::remote::{
    BlockUploader, CloudContentCreator, CloudFileCleaner, CloudRevisionCommitter, CommitOutcome,
    CreatedRevision, RevisionCommit, UploadLink, UploadLinks, UploadedRevisionChecker,
    VerificationData, VerificationDataSource,
};

const VERIFICATION_CODE_SIZE: usize = 32;
const THUMBNAIL_SLOT: &str = "thumbnail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    CreateRevision { node_id: NodeId, revision_id: RevisionId },
    RequestLinks { revision_id: RevisionId, blocks: Vec<u32>, thumbnail: bool },
    PutStarted { revision_id: RevisionId, slot: String },
    PutDone { revision_id: RevisionId, slot: String },
    FindByDigest { name: String, sha1: String },
    CheckRevision { revision_id: RevisionId },
    Commit { revision_id: RevisionId },
    ConfirmVerification { revision_id: RevisionId, tokens: usize },
    DeleteFile { node_id: NodeId },
    FetchVerificationData { revision_id: RevisionId },
    FetchBlock { revision_id: RevisionId, index: u32 },
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call: CloudCall,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub enum PutFault {
    Transient,
    Server(u16),
}

#[derive(Debug, Clone)]
struct LinkTarget {
    revision_id: RevisionId,
    slot: String,
    token: String,
}

#[derive(Debug)]
struct RemoteRevision {
    share_id: ShareId,
    parent_id: NodeId,
    name: String,
    content_key_packet: Option<String>,
    verification_code: Vec<u8>,
    /// slot -> base64 SHA-256 of the stored ciphertext
    uploaded: HashMap<String, String>,
    active: bool,
    commit: Option<RevisionCommit>,
    confirmed: Option<Vec<BlockToken>>,
}

#[derive(Default)]
struct CloudState {
    next_id: u64,
    revisions: HashMap<RevisionId, RemoteRevision>,
    /// node -> revisions, oldest first
    nodes: HashMap<NodeId, Vec<RevisionId>>,
    links: HashMap<String, LinkTarget>,
    /// (share, parent, name, sha1) -> committed revision
    digests: HashMap<DigestKey, UploadingFileIdentifier>,
    calls: Vec<CallRecord>,

    quota_exceeded: bool,
    require_verification: bool,
    put_faults: HashMap<u32, (PutFault, u32)>,
    put_delays: HashMap<u32, Duration>,
    held_puts: HashSet<u32>,
    verification_held: bool,
    commit_faults: VecDeque<NimbusError>,
    lose_commit_response: bool,
    phantom_commit: bool,
    lookup_fault: bool,
}

type DigestKey = (ShareId, NodeId, String, String);

impl CloudState {
    fn record(&mut self, call: CloudCall) {
        self.calls.push(CallRecord {
            call,
            at: Instant::now(),
        });
    }

    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn revision(&self, id: &UploadingFileIdentifier) -> NimbusResult<&RemoteRevision> {
        self.revisions.get(&id.revision_id).ok_or_else(|| not_found(id))
    }

    fn revision_mut(&mut self, id: &UploadingFileIdentifier) -> NimbusResult<&mut RemoteRevision> {
        self.revisions.get_mut(&id.revision_id).ok_or_else(|| not_found(id))
    }
}

fn not_found(id: &UploadingFileIdentifier) -> NimbusError {
    NimbusError::Server {
        status: 404,
        message: format!("revision {} not found", id.revision_id),
    }
}

fn random_bytes(n: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

fn slot_index(slot: &str) -> Option<u32> {
    slot.parse().ok()
}

pub struct MemoryCloud {
    objects: BlockObjectStore,
    state: Mutex<CloudState>,
    gate: watch::Sender<u64>,
}

impl MemoryCloud {
    pub fn new() -> NimbusResult<Self> {
        let (gate, _) = watch::channel(0);
        Ok(Self {
            objects: BlockObjectStore::new(memory_operator()?, "blocks"),
            state: Mutex::new(CloudState {
                require_verification: true,
                ..CloudState::default()
            }),
            gate,
        })
    }

    fn object_key(&self, revision_id: &RevisionId, slot: &str) -> String {
        format!("{}{slot}", self.objects.revision_dir(revision_id.as_str()))
    }

    // --- fault injection ----------------------------------------------------

    pub fn set_quota_exceeded(&self, exceeded: bool) {
        self.state.lock().quota_exceeded = exceeded;
    }

    pub fn set_require_verification(&self, required: bool) {
        self.state.lock().require_verification = required;
    }

    /// Fail the next `times` PUTs of block `index`.
    pub fn fail_puts(&self, index: u32, fault: PutFault, times: u32) {
        self.state.lock().put_faults.insert(index, (fault, times));
    }

    pub fn delay_puts(&self, index: u32, delay: Duration) {
        self.state.lock().put_delays.insert(index, delay);
    }

    /// PUTs of these blocks wait until `release_puts`.
    pub fn hold_puts(&self, indices: impl IntoIterator<Item = u32>) {
        self.state.lock().held_puts.extend(indices);
    }

    pub fn release_puts(&self) {
        self.state.lock().held_puts.clear();
        self.gate.send_modify(|generation| *generation += 1);
    }

    /// Verification data requests wait until `release_verification`.
    pub fn hold_verification(&self) {
        self.state.lock().verification_held = true;
    }

    pub fn release_verification(&self) {
        self.state.lock().verification_held = false;
        self.gate.send_modify(|generation| *generation += 1);
    }

    async fn wait_for_gate(&self, held: impl Fn(&CloudState) -> bool) {
        let mut gate = self.gate.subscribe();
        loop {
            let blocked = held(&*self.state.lock());
            if !blocked || gate.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn fail_next_commit(&self, error: NimbusError) {
        self.state.lock().commit_faults.push_back(error);
    }

    /// Apply the next commit, then report a dropped connection.
    pub fn lose_next_commit_response(&self) {
        self.state.lock().lose_commit_response = true;
    }

    /// Answer the next commit with "already exists" without activating
    /// the revision.
    pub fn report_next_commit_as_existing(&self) {
        self.state.lock().phantom_commit = true;
    }

    pub fn fail_digest_lookup(&self, fail: bool) {
        self.state.lock().lookup_fault = fail;
    }

    /// Register an already-committed file `name` under `parent`.
    pub fn seed_existing(
        &self,
        share: &ShareId,
        parent: &NodeId,
        name: &str,
        sha1: &str,
    ) -> UploadingFileIdentifier {
        let mut st = self.state.lock();
        let node_id = NodeId::from(st.next("node"));
        let revision_id = RevisionId::from(st.next("rev"));
        let identifier = UploadingFileIdentifier {
            node_id: node_id.clone(),
            share_id: share.clone(),
            revision_id: revision_id.clone(),
        };
        st.revisions.insert(
            revision_id.clone(),
            RemoteRevision {
                share_id: share.clone(),
                parent_id: parent.clone(),
                name: name.to_string(),
                content_key_packet: None,
                verification_code: Vec::new(),
                uploaded: HashMap::new(),
                active: true,
                commit: None,
                confirmed: None,
            },
        );
        st.nodes.insert(node_id, vec![revision_id]);
        st.digests.insert(
            (share.clone(), parent.clone(), name.to_string(), sha1.to_string()),
            identifier.clone(),
        );
        identifier
    }

    /// Flip one byte of a stored block.
    pub async fn corrupt_block(&self, revision_id: &RevisionId, index: u32) -> NimbusResult<()> {
        let key = self.object_key(revision_id, &index.to_string());
        let Some(mut data) = self.objects.get(&key).await? else {
            return Err(NimbusError::local_state(format!("no stored block {key}")));
        };
        if let Some(last) = data.last_mut() {
            *last ^= 0xff;
        }
        self.objects.put(&key, data).await?;
        Ok(())
    }

    pub async fn drop_block(&self, revision_id: &RevisionId, index: u32) -> NimbusResult<()> {
        let key = self.object_key(revision_id, &index.to_string());
        self.objects
            .operator()
            .delete(&key)
            .await
            .map_err(|e| NimbusError::Other(e.into()))
    }

    // --- inspection ---------------------------------------------------------

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&CloudCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(&c.call)).count()
    }

    /// Timestamps of the calls matching `pred`, in call order.
    pub fn times(&self, pred: impl Fn(&CloudCall) -> bool) -> Vec<Instant> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| pred(&c.call))
            .map(|c| c.at)
            .collect()
    }

    /// Block indices whose PUT completed, in completion order.
    pub fn uploaded_blocks(&self) -> Vec<u32> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match &c.call {
                CloudCall::PutDone { slot, .. } => slot_index(slot),
                _ => None,
            })
            .collect()
    }

    pub fn is_active(&self, revision_id: &RevisionId) -> bool {
        self.state
            .lock()
            .revisions
            .get(revision_id)
            .is_some_and(|r| r.active)
    }

    pub fn committed(&self, revision_id: &RevisionId) -> Option<RevisionCommit> {
        self.state
            .lock()
            .revisions
            .get(revision_id)
            .and_then(|r| r.commit.clone())
    }

    pub fn confirmed_tokens(&self, revision_id: &RevisionId) -> Option<Vec<BlockToken>> {
        self.state
            .lock()
            .revisions
            .get(revision_id)
            .and_then(|r| r.confirmed.clone())
    }

    pub fn node_exists(&self, node_id: &NodeId) -> bool {
        self.state.lock().nodes.contains_key(node_id)
    }

    pub async fn stored_block(&self, revision_id: &RevisionId, index: u32) -> NimbusResult<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get(&self.object_key(revision_id, &index.to_string()))
            .await?)
    }

    /// Expected proof token for a stored block.
    async fn expected_token(
        &self,
        revision_id: &RevisionId,
        index: u32,
        code: &[u8],
    ) -> NimbusResult<Option<BlockToken>> {
        Ok(self
            .stored_block(revision_id, index)
            .await?
            .map(|data| derive_block_token(index, code, &data)))
    }
}

impl std::fmt::Debug for MemoryCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("MemoryCloud")
            .field("revisions", &st.revisions.len())
            .field("calls", &st.calls.len())
            .finish()
    }
}

#[async_trait]
impl CloudContentCreator for MemoryCloud {
    async fn create_revision(&self, file: &FileRecord) -> NimbusResult<CreatedRevision> {
        let mut st = self.state.lock();
        if st.quota_exceeded {
            return Err(ValidationError::QuotaExceeded.into());
        }
        let node_id = match &file.node_id {
            Some(id) => id.clone(),
            None => NodeId::from(st.next("node")),
        };
        let revision_id = RevisionId::from(st.next("rev"));
        st.revisions.insert(
            revision_id.clone(),
            RemoteRevision {
                share_id: file.share_id.clone(),
                parent_id: file.parent_id.clone(),
                name: file.name.clone(),
                content_key_packet: file.content_key_packet.clone(),
                verification_code: random_bytes(VERIFICATION_CODE_SIZE),
                uploaded: HashMap::new(),
                active: false,
                commit: None,
                confirmed: None,
            },
        );
        st.nodes.entry(node_id.clone()).or_default().push(revision_id.clone());
        st.record(CloudCall::CreateRevision {
            node_id: node_id.clone(),
            revision_id: revision_id.clone(),
        });
        Ok(CreatedRevision {
            node_id,
            revision_id,
        })
    }

    async fn request_upload_links(
        &self,
        id: &UploadingFileIdentifier,
        blocks: &[(u32, u64)],
        thumbnail_size: Option<u64>,
    ) -> NimbusResult<UploadLinks> {
        let mut st = self.state.lock();
        st.revision(id)?;
        let issue = |st: &mut CloudState, slot: String| {
            let url = format!("mem://{}/{slot}/{}", id.revision_id, st.next("link"));
            let token = B64.encode(random_bytes(16));
            st.links.insert(
                url.clone(),
                LinkTarget {
                    revision_id: id.revision_id.clone(),
                    slot,
                    token: token.clone(),
                },
            );
            UploadLink { url, token }
        };
        let links = UploadLinks {
            blocks: blocks
                .iter()
                .map(|(index, _)| (*index, issue(&mut *st, index.to_string())))
                .collect(),
            thumbnail: thumbnail_size.map(|_| issue(&mut *st, THUMBNAIL_SLOT.to_string())),
        };
        st.record(CloudCall::RequestLinks {
            revision_id: id.revision_id.clone(),
            blocks: blocks.iter().map(|(i, _)| *i).collect(),
            thumbnail: thumbnail_size.is_some(),
        });
        Ok(links)
    }
}

#[async_trait]
impl BlockUploader for MemoryCloud {
    async fn put_block(&self, link: &UploadLink, data: Vec<u8>, sha256: &str) -> NimbusResult<()> {
        let (target, delay, fault) = {
            let mut st = self.state.lock();
            let target = st
                .links
                .get(&link.url)
                .filter(|t| t.token == link.token)
                .cloned()
                .ok_or_else(|| NimbusError::Server {
                    status: 403,
                    message: format!("unknown upload link {}", link.url),
                })?;
            st.record(CloudCall::PutStarted {
                revision_id: target.revision_id.clone(),
                slot: target.slot.clone(),
            });
            let index = slot_index(&target.slot);
            let delay = index.and_then(|i| st.put_delays.get(&i).copied());
            let fault = index.and_then(|i| match st.put_faults.get_mut(&i) {
                Some((fault, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*fault)
                }
                _ => None,
            });
            (target, delay, fault)
        };

        if let Some(index) = slot_index(&target.slot) {
            self.wait_for_gate(|st| st.held_puts.contains(&index)).await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match fault {
            Some(PutFault::Transient) => return Err(NimbusError::transient("connection reset")),
            Some(PutFault::Server(status)) => {
                return Err(NimbusError::Server {
                    status,
                    message: "injected server failure".into(),
                })
            }
            None => {}
        }

        let actual = B64.encode(nimbus_chunks::sha256(&data));
        if actual != sha256 {
            return Err(ValidationError::Rejected(format!(
                "block {} hash mismatch",
                target.slot
            ))
            .into());
        }
        self.objects
            .put(&self.object_key(&target.revision_id, &target.slot), data)
            .await?;

        let mut st = self.state.lock();
        if let Some(rev) = st.revisions.get_mut(&target.revision_id) {
            rev.uploaded.insert(target.slot.clone(), actual);
        }
        st.record(CloudCall::PutDone {
            revision_id: target.revision_id,
            slot: target.slot,
        });
        Ok(())
    }
}

#[async_trait]
impl UploadedRevisionChecker for MemoryCloud {
    async fn find_by_digest(
        &self,
        share: &ShareId,
        parent: &NodeId,
        name: &str,
        sha1: &str,
    ) -> NimbusResult<Option<UploadingFileIdentifier>> {
        let mut st = self.state.lock();
        st.record(CloudCall::FindByDigest {
            name: name.to_string(),
            sha1: sha1.to_string(),
        });
        if st.lookup_fault {
            return Err(NimbusError::transient("digest lookup unavailable"));
        }
        Ok(st
            .digests
            .get(&(share.clone(), parent.clone(), name.to_string(), sha1.to_string()))
            .cloned())
    }

    async fn check_uploaded_revision(&self, id: &UploadingFileIdentifier) -> NimbusResult<Option<String>> {
        let mut st = self.state.lock();
        st.record(CloudCall::CheckRevision {
            revision_id: id.revision_id.clone(),
        });
        let rev = st.revision(id)?;
        if !rev.active {
            return Ok(None);
        }
        match &rev.commit {
            Some(commit) => Ok(Some(commit.xattr.clone())),
            None => Err(NimbusError::Server {
                status: 422,
                message: format!("active revision {} has no extended attributes", id.revision_id),
            }),
        }
    }
}

#[async_trait]
impl CloudRevisionCommitter for MemoryCloud {
    async fn commit_revision(
        &self,
        id: &UploadingFileIdentifier,
        commit: &RevisionCommit,
    ) -> NimbusResult<CommitOutcome> {
        let mut st = self.state.lock();
        st.record(CloudCall::Commit {
            revision_id: id.revision_id.clone(),
        });
        if let Some(err) = st.commit_faults.pop_front() {
            return Err(err);
        }
        let require_verification = st.require_verification;
        if std::mem::take(&mut st.phantom_commit) {
            st.revision(id)?;
            return Ok(CommitOutcome::AlreadyExists);
        }
        let rev = st.revision_mut(id)?;
        if rev.active {
            return Ok(CommitOutcome::AlreadyExists);
        }
        for block in &commit.blocks {
            match rev.uploaded.get(&block.index.to_string()) {
                Some(sha) if *sha == block.sha256 => {}
                _ => {
                    return Err(ValidationError::Rejected(format!(
                        "block {} was not uploaded",
                        block.index
                    ))
                    .into())
                }
            }
        }
        if let Some(sha) = &commit.thumbnail_sha256 {
            if rev.uploaded.get(THUMBNAIL_SLOT) != Some(sha) {
                return Err(ValidationError::Rejected("thumbnail was not uploaded".into()).into());
            }
        }
        rev.active = true;
        rev.commit = Some(commit.clone());
        let (share, parent, name) = (rev.share_id.clone(), rev.parent_id.clone(), rev.name.clone());
        if let Some(digest) = &commit.content_digest {
            st.digests.insert((share, parent, name, digest.clone()), id.clone());
        }
        if std::mem::take(&mut st.lose_commit_response) {
            return Err(NimbusError::transient("connection reset after commit"));
        }
        Ok(CommitOutcome::Accepted {
            verification_pending: require_verification,
        })
    }

    async fn confirm_verification(
        &self,
        id: &UploadingFileIdentifier,
        tokens: &[BlockToken],
    ) -> NimbusResult<()> {
        let code = {
            let mut st = self.state.lock();
            st.record(CloudCall::ConfirmVerification {
                revision_id: id.revision_id.clone(),
                tokens: tokens.len(),
            });
            st.revision(id)?.verification_code.clone()
        };
        for token in tokens {
            let expected = self.expected_token(&id.revision_id, token.index, &code).await?;
            if expected.as_ref() != Some(token) {
                return Err(ValidationError::Rejected(format!(
                    "verification token for block {} does not match",
                    token.index
                ))
                .into());
            }
        }
        self.state.lock().revision_mut(id)?.confirmed = Some(tokens.to_vec());
        Ok(())
    }
}

#[async_trait]
impl CloudFileCleaner for MemoryCloud {
    async fn delete_uploading_file(&self, share: &ShareId, node: &NodeId) -> NimbusResult<()> {
        let revisions = {
            let mut st = self.state.lock();
            st.record(CloudCall::DeleteFile { node_id: node.clone() });
            let Some(revisions) = st.nodes.remove(node) else {
                return Ok(());
            };
            for rev in &revisions {
                st.revisions.remove(rev);
            }
            st.links.retain(|_, t| !revisions.contains(&t.revision_id));
            st.digests.retain(|(s, ..), id| !(s == share && id.node_id == *node));
            revisions
        };
        for rev in revisions {
            let deleted = self.objects.delete_revision(rev.as_str()).await?;
            tracing::debug!(revision_id = %rev, deleted, "revision objects removed");
        }
        Ok(())
    }
}

#[async_trait]
impl VerificationDataSource for MemoryCloud {
    async fn fetch_verification_data(&self, id: &UploadingFileIdentifier) -> NimbusResult<VerificationData> {
        self.wait_for_gate(|st| st.verification_held).await;
        let mut st = self.state.lock();
        st.record(CloudCall::FetchVerificationData {
            revision_id: id.revision_id.clone(),
        });
        let rev = st.revision(id)?;
        let packet = rev.content_key_packet.clone().ok_or_else(|| NimbusError::Server {
            status: 422,
            message: "revision has no content key packet".into(),
        })?;
        Ok(VerificationData {
            verification_code: B64.encode(&rev.verification_code),
            content_key_packet: packet,
        })
    }

    async fn fetch_block(
        &self,
        id: &UploadingFileIdentifier,
        index: u32,
        url: &str,
    ) -> NimbusResult<Option<Vec<u8>>> {
        let target = {
            let mut st = self.state.lock();
            st.record(CloudCall::FetchBlock {
                revision_id: id.revision_id.clone(),
                index,
            });
            st.links.get(url).cloned()
        };
        match target {
            Some(t) if t.revision_id == id.revision_id && slot_index(&t.slot) == Some(index) => {
                Ok(self.objects.get(&self.object_key(&t.revision_id, &t.slot)).await?)
            }
            _ => Ok(None),
        }
    }
}
