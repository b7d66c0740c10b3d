//! Contact identity consolidation.
//!
//! Contact records observed one request at a time are folded into clusters
//! that share a single primary record. [`resolve`] is the consolidation
//! algorithm; it runs against any [`ContactStore`] that is already scoped to a
//! single transaction. Transaction handling, pooling and retry belong to the
//! store implementation (see `contact-identity-store-sqlite`).

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("integrity violation: {0}")]
    IntegrityViolation(IntegrityViolation),
}

impl IdentityError {
    /// Whether retrying the whole resolution from scratch may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store constraint violated: {0}")]
    Constraint(String),
    #[error("store write conflict: {0}")]
    Conflict(String),
    #[error("store pool exhausted after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },
    #[error("store returned an unreadable row: {0}")]
    Corrupt(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Store state that breaks the cluster invariants before a call even started.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityViolation {
    /// Matched records are all secondaries without a `linked_id`.
    UnrootedMatches { contact_ids: Vec<ContactId> },
    /// None of the cluster roots resolved to a live primary record.
    PrimaryMissing { root_ids: Vec<ContactId> },
    /// Some roots resolved to a live primary, others did not.
    DanglingRoots { root_ids: Vec<ContactId> },
}

impl Display for IntegrityViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnrootedMatches { contact_ids } => write!(
                f,
                "matched secondaries have no linked primary: {}",
                join_ids(contact_ids)
            ),
            Self::PrimaryMissing { root_ids } => write!(
                f,
                "no live primary found for cluster roots: {}",
                join_ids(root_ids)
            ),
            Self::DanglingRoots { root_ids } => write!(
                f,
                "cluster roots are not live primaries: {}",
                join_ids(root_ids)
            ),
        }
    }
}

fn join_ids(ids: &[ContactId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl ContactRecord {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Id of the primary this record belongs to, if it can be determined.
    #[must_use]
    pub fn cluster_root(&self) -> Option<ContactId> {
        match self.link_precedence {
            LinkPrecedence::Primary => Some(self.id),
            LinkPrecedence::Secondary => self.linked_id,
        }
    }

    /// Ordering key for "oldest wins": creation time, then lowest id.
    #[must_use]
    pub fn chronological_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

/// Sorts records oldest first, breaking creation-time ties by id.
pub fn sort_chronologically(records: &mut [ContactRecord]) {
    records.sort_by_key(ContactRecord::chronological_key);
}

/// Insert payload handed to [`ContactStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewContact<'a> {
    pub email: Option<&'a str>,
    pub phone_number: Option<&'a str>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl<'a> NewContact<'a> {
    #[must_use]
    pub fn primary(email: Option<&'a str>, phone_number: Option<&'a str>) -> Self {
        Self {
            email,
            phone_number,
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    #[must_use]
    pub fn secondary(
        email: Option<&'a str>,
        phone_number: Option<&'a str>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email,
            phone_number,
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// A validated `(email, phone)` pair submitted for resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Normalizes and validates raw request fields.
    ///
    /// Empty strings count as absent. An email must pass
    /// [`is_plausible_email`]; a phone number must be ASCII digits only.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidInput`] when neither field is usable or
    /// either one is malformed.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, IdentityError> {
        let email = email.filter(|value| !value.is_empty());
        let phone_number = phone_number.filter(|value| !value.is_empty());

        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::InvalidInput(
                "either email or phoneNumber must be provided".to_string(),
            ));
        }

        if let Some(address) = email {
            if !is_plausible_email(address) {
                return Err(IdentityError::InvalidInput(format!(
                    "email is not a valid address: {address}"
                )));
            }
        }

        if let Some(phone) = phone_number {
            if !is_valid_phone_number(phone) {
                return Err(IdentityError::InvalidInput(format!(
                    "phoneNumber must contain digits only: {phone}"
                )));
            }
        }

        Ok(Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

#[must_use]
pub fn is_valid_phone_number(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|byte| byte.is_ascii_digit())
}

/// Structural address check: one `@`, non-empty local part, a dotted domain
/// without empty labels, no whitespace.
#[must_use]
pub fn is_plausible_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

/// Consolidated view of one cluster, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Wire envelope of `POST /api/identify`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyResponse {
    pub contact: IdentityView,
}

impl From<IdentityView> for IdentifyResponse {
    fn from(contact: IdentityView) -> Self {
        Self { contact }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityPolicy {
    /// Abort the call and roll back.
    #[default]
    Reject,
    /// Create a fresh primary and absorb the broken records into it.
    Repair,
}

impl IntegrityPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "reject",
            Self::Repair => "repair",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reject" => Some(Self::Reject),
            "repair" => Some(Self::Repair),
            _ => None,
        }
    }
}

/// When an `(email, phone)` pairing that no record carries yet gets its own
/// secondary row, given that both values are already known in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NovelPairPolicy {
    /// Record every novel pairing, including the one that bridged two
    /// clusters. Replaying any observation afterwards writes nothing.
    #[default]
    Always,
    /// Skip the pairing on calls that merged clusters. An identical replay
    /// right after the merge records it then.
    SkipOnMerge,
    Never,
}

impl NovelPairPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SkipOnMerge => "skip_on_merge",
            Self::Always => "always",
            Self::Never => "never",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "skip_on_merge" | "skip-on-merge" => Some(Self::SkipOnMerge),
            "always" => Some(Self::Always),
            "never" => Some(Self::Never),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolveOptions {
    pub integrity_policy: IntegrityPolicy,
    pub novel_pairs: NovelPairPolicy,
}

/// What a single resolution wrote.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ResolutionReport {
    pub created_primary: Option<ContactId>,
    pub demoted_primaries: Vec<ContactId>,
    pub created_secondary: Option<ContactId>,
    pub repaired: Option<IntegrityViolation>,
}

impl ResolutionReport {
    #[must_use]
    pub fn wrote_anything(&self) -> bool {
        self.created_primary.is_some()
            || self.created_secondary.is_some()
            || !self.demoted_primaries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub view: IdentityView,
    pub report: ResolutionReport,
}

/// Contact persistence scoped to one ambient transaction.
///
/// Every read excludes soft-deleted rows and returns records oldest first
/// (creation time, then id).
pub trait ContactStore {
    fn get(&mut self, id: ContactId) -> Result<Option<ContactRecord>, StoreError>;

    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError>;

    /// Root records plus every record whose `linked_id` is one of the roots.
    fn find_closure(&mut self, roots: &BTreeSet<ContactId>)
        -> Result<Vec<ContactRecord>, StoreError>;

    /// The primary plus its current secondaries.
    fn find_cluster_of(&mut self, primary_id: ContactId) -> Result<Vec<ContactRecord>, StoreError>;

    fn insert(&mut self, contact: NewContact<'_>) -> Result<ContactRecord, StoreError>;

    /// Sets precedence to secondary and points the record at `new_linked_id`.
    fn demote_and_relink(
        &mut self,
        contact_id: ContactId,
        new_linked_id: ContactId,
    ) -> Result<(), StoreError>;

    /// Re-points every record linked to `old_linked_id`; returns rows touched.
    fn relink_children(
        &mut self,
        old_linked_id: ContactId,
        new_linked_id: ContactId,
    ) -> Result<usize, StoreError>;
}

/// Folds an observation into the store and returns the consolidated cluster.
///
/// The caller owns the transaction: on `Err` nothing written here may be
/// committed.
///
/// # Errors
/// Returns [`IdentityError::Store`] when a store operation fails and
/// [`IdentityError::IntegrityViolation`] when the matched clusters are already
/// inconsistent and `options.integrity_policy` is [`IntegrityPolicy::Reject`].
pub fn resolve<S>(
    store: &mut S,
    observation: &Observation,
    options: &ResolveOptions,
) -> Result<Resolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let email = observation.email();
    let phone_number = observation.phone_number();
    let mut report = ResolutionReport::default();

    let matches = store.find_by_email_or_phone(email, phone_number)?;
    if matches.is_empty() {
        let primary = store.insert(NewContact::primary(email, phone_number))?;
        info!(contact_id = %primary.id, "created primary contact");
        report.created_primary = Some(primary.id);
        let view = assemble_view(&primary, std::slice::from_ref(&primary));
        return Ok(Resolution { view, report });
    }

    let roots: BTreeSet<ContactId> = matches
        .iter()
        .filter_map(ContactRecord::cluster_root)
        .collect();
    debug!(
        matched = matches.len(),
        roots = roots.len(),
        "collected cluster roots"
    );

    let ultimate = if roots.is_empty() {
        let violation = IntegrityViolation::UnrootedMatches {
            contact_ids: matches.iter().map(|record| record.id).collect(),
        };
        adopt_into_new_primary(store, observation, &matches, violation, options, &mut report)?
    } else {
        let closure = store.find_closure(&roots)?;
        match earliest_primary(&closure) {
            Some(ultimate) => {
                merge_into(store, &ultimate, &closure, &roots, options, &mut report)?;
                ultimate
            }
            None => {
                let violation = IntegrityViolation::PrimaryMissing {
                    root_ids: roots.iter().copied().collect(),
                };
                adopt_into_new_primary(store, observation, &closure, violation, options, &mut report)?
            }
        }
    };

    let mut cluster = store.find_cluster_of(ultimate.id)?;
    if !cluster.iter().any(|record| record.id == ultimate.id) {
        cluster.push(ultimate.clone());
    }
    sort_chronologically(&mut cluster);

    if needs_gap_fill(&cluster, observation, options.novel_pairs, &report) {
        let secondary =
            store.insert(NewContact::secondary(email, phone_number, ultimate.id))?;
        info!(
            contact_id = %secondary.id,
            primary_id = %ultimate.id,
            "created secondary contact for new information"
        );
        report.created_secondary = Some(secondary.id);
        cluster.push(secondary);
    }

    let view = assemble_view(&ultimate, &cluster);
    Ok(Resolution { view, report })
}

/// Returns the consolidated view of the cluster that contains `contact_id`.
///
/// # Errors
/// Returns [`IdentityError::Store`] on store failures and
/// [`IdentityError::IntegrityViolation`] when the contact's primary is missing.
pub fn cluster_view<S>(
    store: &mut S,
    contact_id: ContactId,
) -> Result<Option<IdentityView>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let Some(record) = store.get(contact_id)? else {
        return Ok(None);
    };

    let Some(root_id) = record.cluster_root() else {
        return Err(IdentityError::IntegrityViolation(
            IntegrityViolation::UnrootedMatches {
                contact_ids: vec![record.id],
            },
        ));
    };

    let primary = match store.get(root_id)? {
        Some(primary) if primary.is_primary() => primary,
        _ => {
            return Err(IdentityError::IntegrityViolation(
                IntegrityViolation::PrimaryMissing {
                    root_ids: vec![root_id],
                },
            ))
        }
    };

    let mut cluster = store.find_cluster_of(primary.id)?;
    sort_chronologically(&mut cluster);
    Ok(Some(assemble_view(&primary, &cluster)))
}

fn earliest_primary(records: &[ContactRecord]) -> Option<ContactRecord> {
    records
        .iter()
        .filter(|record| record.is_primary())
        .min_by_key(|record| record.chronological_key())
        .cloned()
}

fn merge_into<S>(
    store: &mut S,
    ultimate: &ContactRecord,
    closure: &[ContactRecord],
    roots: &BTreeSet<ContactId>,
    options: &ResolveOptions,
    report: &mut ResolutionReport,
) -> Result<(), IdentityError>
where
    S: ContactStore + ?Sized,
{
    let live_primaries: BTreeSet<ContactId> = closure
        .iter()
        .filter(|record| record.is_primary())
        .map(|record| record.id)
        .collect();

    let dangling: Vec<ContactId> = roots
        .iter()
        .filter(|root| !live_primaries.contains(root))
        .copied()
        .collect();
    if !dangling.is_empty() {
        let violation = IntegrityViolation::DanglingRoots {
            root_ids: dangling.clone(),
        };
        if options.integrity_policy == IntegrityPolicy::Reject {
            error!(%violation, "refusing to merge clusters with dangling roots");
            return Err(IdentityError::IntegrityViolation(violation));
        }
        warn!(%violation, primary_id = %ultimate.id, "re-pointing records of dangling roots");
        for root in &dangling {
            if closure.iter().any(|record| record.id == *root) {
                store.demote_and_relink(*root, ultimate.id)?;
            }
            store.relink_children(*root, ultimate.id)?;
        }
        report.repaired = Some(violation);
    }

    for demoted in live_primaries.iter().filter(|id| **id != ultimate.id) {
        store.demote_and_relink(*demoted, ultimate.id)?;
        let moved = store.relink_children(*demoted, ultimate.id)?;
        info!(
            demoted_id = %demoted,
            primary_id = %ultimate.id,
            moved_secondaries = moved,
            "merged cluster into older primary"
        );
        report.demoted_primaries.push(*demoted);
    }

    Ok(())
}

fn adopt_into_new_primary<S>(
    store: &mut S,
    observation: &Observation,
    members: &[ContactRecord],
    violation: IntegrityViolation,
    options: &ResolveOptions,
    report: &mut ResolutionReport,
) -> Result<ContactRecord, IdentityError>
where
    S: ContactStore + ?Sized,
{
    if options.integrity_policy == IntegrityPolicy::Reject {
        error!(%violation, "refusing to resolve against inconsistent clusters");
        return Err(IdentityError::IntegrityViolation(violation));
    }

    let primary = store.insert(NewContact::primary(
        observation.email(),
        observation.phone_number(),
    ))?;
    warn!(
        %violation,
        primary_id = %primary.id,
        absorbed = members.len(),
        "repaired inconsistent cluster with a fresh primary"
    );
    for member in members.iter().filter(|member| member.id != primary.id) {
        store.demote_and_relink(member.id, primary.id)?;
    }

    report.created_primary = Some(primary.id);
    report.repaired = Some(violation);
    Ok(primary)
}

fn needs_gap_fill(
    cluster: &[ContactRecord],
    observation: &Observation,
    novel_pairs: NovelPairPolicy,
    report: &ResolutionReport,
) -> bool {
    let email = observation.email();
    let phone_number = observation.phone_number();

    let email_known =
        email.map_or(true, |value| cluster.iter().any(|record| record.email.as_deref() == Some(value)));
    if !email_known {
        return true;
    }

    let phone_known = phone_number.map_or(true, |value| {
        cluster
            .iter()
            .any(|record| record.phone_number.as_deref() == Some(value))
    });
    if !phone_known {
        return true;
    }

    let (Some(email), Some(phone_number)) = (email, phone_number) else {
        return false;
    };
    let pair_known = cluster.iter().any(|record| {
        record.email.as_deref() == Some(email) && record.phone_number.as_deref() == Some(phone_number)
    });
    if pair_known {
        return false;
    }

    match novel_pairs {
        NovelPairPolicy::Always => true,
        NovelPairPolicy::Never => false,
        NovelPairPolicy::SkipOnMerge => report.demoted_primaries.is_empty(),
    }
}

/// Builds the caller-facing view. `cluster` must be in chronological order.
#[must_use]
pub fn assemble_view(primary: &ContactRecord, cluster: &[ContactRecord]) -> IdentityView {
    let mut emails: Vec<String> = primary.email.iter().cloned().collect();
    let mut phone_numbers: Vec<String> = primary.phone_number.iter().cloned().collect();
    let mut secondary_ids = BTreeSet::new();

    for record in cluster {
        if let Some(email) = &record.email {
            if !emails.contains(email) {
                emails.push(email.clone());
            }
        }
        if let Some(phone_number) = &record.phone_number {
            if !phone_numbers.contains(phone_number) {
                phone_numbers.push(phone_number.clone());
            }
        }
        if record.id != primary.id {
            secondary_ids.insert(record.id);
        }
    }

    IdentityView {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondary_ids.into_iter().collect(),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`StoreError::Corrupt`] when parsing fails or the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, StoreError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Corrupt(format!("invalid RFC3339 timestamp {value}: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(StoreError::Corrupt(format!(
            "timestamp MUST use UTC offset Z: {value}"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`StoreError::Backend`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Backend(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
