//! Acoustic model objects.
//!
//! An [`HmmSet`] owns every piece of a loaded acoustic model in flat arenas
//! indexed by small integer ids: Gaussian densities, mixture states,
//! transition matrices, physical HMMs and the logical name layer on top.
//! Everything is immutable once loading (or programmatic construction)
//! finishes; decoding-time caches live in per-utterance side tables owned by
//! the search, never here, so one `HmmSet` can back any number of
//! utterances.
//!
//! Context-dependent model names follow the HTK convention
//! `left-center+right`. Where an exact triphone is not defined, a **pseudo
//! phone** stands in: the set of states of all defined triphones matching
//! the known part of the name.

pub mod binio;

use crate::config::AnalysisConfig;
use std::collections::BTreeMap;
use thiserror::Error;

pub type DensId = u32;
pub type StateId = u32;
pub type TransId = u32;
pub type PhysId = u32;
pub type LogId = u32;
pub type PseudoId = u32;

/// Log probability floor standing in for probability zero.
pub const LOG_ZERO: f32 = -1.0e10;

/// Add two probabilities given in natural log domain.
pub fn add_log_probs(x: f32, y: f32) -> f32 {
    if x <= LOG_ZERO / 2.0 {
        return y;
    }
    if y <= LOG_ZERO / 2.0 {
        return x;
    }
    let (hi, lo) = if x > y { (x, y) } else { (y, x) };
    hi + (lo - hi).exp().ln_1p()
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid model format: {0}")]
    Format(String),

    #[error("unsupported model feature: {0}")]
    Unsupported(String),

    #[error("undefined reference in model: {0}")]
    UndefinedReference(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single diagonal-covariance Gaussian.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian {
    pub mean: Vec<f32>,
    /// Inverse variances, the form used by the likelihood kernel.
    pub inv_var: Vec<f32>,
    /// `D·ln(2π) + Σ ln σ²`, precomputed at load.
    pub gconst: f32,
}

impl Gaussian {
    /// Build from mean and (non-inverted) variances.
    pub fn from_variance(mean: Vec<f32>, var: Vec<f32>) -> Self {
        let inv_var: Vec<f32> = var.iter().map(|v| 1.0 / v).collect();
        Self::from_inverse_variance(mean, inv_var)
    }

    /// Build from mean and already-inverted variances.
    pub fn from_inverse_variance(mean: Vec<f32>, inv_var: Vec<f32>) -> Self {
        let dim = mean.len() as f32;
        let ln_det: f32 = inv_var.iter().map(|iv| -iv.ln()).sum();
        let gconst = dim * (2.0 * std::f32::consts::PI).ln() + ln_det;
        Self {
            mean,
            inv_var,
            gconst,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Mixture PDF of one stream: parallel component weights (log) and density
/// ids.
#[derive(Debug, Clone, PartialEq)]
pub struct MixturePdf {
    pub weights: Vec<f32>,
    pub dens: Vec<DensId>,
}

impl MixturePdf {
    pub fn len(&self) -> usize {
        self.dens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dens.is_empty()
    }
}

/// An emitting HMM state: one mixture PDF per stream plus stream weights.
#[derive(Debug, Clone, PartialEq)]
pub struct HmmState {
    pub streams: Vec<MixturePdf>,
    pub stream_weights: Vec<f32>,
}

/// Full HTK-style transition matrix, including the non-emitting entry and
/// exit states. Probabilities are stored as natural logs with [`LOG_ZERO`]
/// for impossible arcs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransMatrix {
    pub nstate: usize,
    logprob: Vec<f32>,
}

impl TransMatrix {
    pub fn new(nstate: usize) -> Self {
        Self {
            nstate,
            logprob: vec![LOG_ZERO; nstate * nstate],
        }
    }

    /// Build from linear probabilities in row-major order.
    pub fn from_linear(nstate: usize, probs: &[f32]) -> Self {
        let logprob = probs
            .iter()
            .map(|&p| if p > 0.0 { p.ln() } else { LOG_ZERO })
            .collect();
        Self { nstate, logprob }
    }

    pub fn get(&self, from: usize, to: usize) -> f32 {
        self.logprob[from * self.nstate + to]
    }

    pub fn set(&mut self, from: usize, to: usize, logp: f32) {
        self.logprob[from * self.nstate + to] = logp;
    }

    pub fn is_arc(&self, from: usize, to: usize) -> bool {
        self.get(from, to) > LOG_ZERO / 2.0
    }

    /// True when any arc deviates from the strict left-to-right
    /// self-or-next pattern (skips, early exits, backward arcs).
    pub fn is_multipath(&self) -> bool {
        for from in 0..self.nstate {
            for to in 0..self.nstate {
                if self.is_arc(from, to) && to != from && to != from + 1 {
                    return true;
                }
            }
        }
        false
    }
}

/// A physical HMM: a named chain of emitting states plus its transition
/// matrix. `states.len() + 2 == trans.nstate` (entry and exit are
/// non-emitting).
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalHmm {
    pub name: String,
    pub states: Vec<StateId>,
    pub trans: TransId,
    pub multipath: bool,
}

impl PhysicalHmm {
    pub fn num_emitting(&self) -> usize {
        self.states.len()
    }
}

/// A pseudo phone: for each state position, the set of alternative states
/// collected from all defined triphones matching a partial context name.
#[derive(Debug, Clone, PartialEq)]
pub struct PseudoPhone {
    pub name: String,
    pub state_sets: Vec<Vec<StateId>>,
    /// Representative member, used for transition shapes.
    pub repr: PhysId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalBody {
    Defined(PhysId),
    Pseudo(PseudoId),
}

/// A logical HMM name, mapping to either a physical model or a pseudo
/// phone.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalHmm {
    pub name: String,
    pub body: LogicalBody,
}

impl LogicalHmm {
    pub fn is_pseudo(&self) -> bool {
        matches!(self.body, LogicalBody::Pseudo(_))
    }
}

/// The complete acoustic model.
#[derive(Debug, Default, PartialEq)]
pub struct HmmSet {
    /// Feature vector length the model was trained on.
    pub vec_len: usize,
    /// Per-stream vector sizes (single stream in the common case).
    pub stream_sizes: Vec<usize>,
    /// HTK covariance kind code, kept for file round-trips.
    pub cov_type: i16,
    /// HTK duration kind code, kept for file round-trips.
    pub dur_type: i16,
    /// HTK parameter kind code, kept for file round-trips.
    pub param_type: i16,

    pub dens: Vec<Gaussian>,
    pub states: Vec<HmmState>,
    pub trans: Vec<TransMatrix>,
    pub physical: Vec<PhysicalHmm>,
    pub logical: Vec<LogicalHmm>,
    pub pseudo: Vec<PseudoPhone>,

    phys_by_name: BTreeMap<String, PhysId>,
    log_by_name: BTreeMap<String, LogId>,
    pseudo_by_name: BTreeMap<String, PseudoId>,

    /// Analysis parameters embedded in the model file, if any.
    pub embedded_analysis: Option<AnalysisConfig>,
}

impl HmmSet {
    pub fn new(vec_len: usize) -> Self {
        Self {
            vec_len,
            stream_sizes: vec![vec_len],
            ..Default::default()
        }
    }

    pub fn num_streams(&self) -> usize {
        self.stream_sizes.len()
    }

    pub fn add_density(&mut self, g: Gaussian) -> DensId {
        self.dens.push(g);
        (self.dens.len() - 1) as DensId
    }

    pub fn add_state(&mut self, s: HmmState) -> StateId {
        self.states.push(s);
        (self.states.len() - 1) as StateId
    }

    pub fn add_transition(&mut self, t: TransMatrix) -> TransId {
        self.trans.push(t);
        (self.trans.len() - 1) as TransId
    }

    /// Register a physical model; multipath is derived from the transition
    /// shape.
    pub fn add_physical(
        &mut self,
        name: &str,
        states: Vec<StateId>,
        trans: TransId,
    ) -> Result<PhysId, ModelError> {
        let tm = &self.trans[trans as usize];
        if tm.nstate != states.len() + 2 {
            return Err(ModelError::Format(format!(
                "model {}: transition size {} does not match {} emitting states",
                name,
                tm.nstate,
                states.len()
            )));
        }
        let multipath = tm.is_multipath();
        let id = self.physical.len() as PhysId;
        self.physical.push(PhysicalHmm {
            name: name.to_string(),
            states,
            trans,
            multipath,
        });
        self.phys_by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Register a logical name pointing at a physical model.
    pub fn define_logical(&mut self, name: &str, phys: PhysId) -> LogId {
        let id = self.logical.len() as LogId;
        self.logical.push(LogicalHmm {
            name: name.to_string(),
            body: LogicalBody::Defined(phys),
        });
        self.log_by_name.insert(name.to_string(), id);
        id
    }

    /// Register one logical name per physical model (the common case when
    /// no HMMList mapping file is used).
    pub fn define_logical_from_physical(&mut self) {
        for id in 0..self.physical.len() {
            let name = self.physical[id].name.clone();
            if !self.log_by_name.contains_key(&name) {
                self.define_logical(&name, id as PhysId);
            }
        }
    }

    /// Load an HMMList-style mapping file: one `logical physical` pair per
    /// line.
    pub fn load_hmmlist(&mut self, content: &str) -> Result<usize, ModelError> {
        let mut n = 0;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut it = line.split_whitespace();
            let logical = it
                .next()
                .ok_or_else(|| ModelError::Format(format!("hmmlist line {}: empty", lineno + 1)))?;
            let physical = it.next().unwrap_or(logical);
            let phys = self.physical_id(physical).ok_or_else(|| {
                ModelError::UndefinedReference(format!(
                    "hmmlist line {}: physical model {} not defined",
                    lineno + 1,
                    physical
                ))
            })?;
            self.define_logical(logical, phys);
            n += 1;
        }
        log::info!("hmmlist: {} logical names mapped", n);
        Ok(n)
    }

    pub fn physical_id(&self, name: &str) -> Option<PhysId> {
        self.phys_by_name.get(name).copied()
    }

    /// Register a physical model name for an already-pushed entry; used by
    /// the binary reader which fills the arena directly.
    pub(crate) fn register_physical_name(&mut self, name: &str, id: PhysId) {
        self.phys_by_name.insert(name.to_string(), id);
    }

    pub fn logical_id(&self, name: &str) -> Option<LogId> {
        self.log_by_name.get(name).copied()
    }

    pub fn pseudo_id(&self, name: &str) -> Option<PseudoId> {
        self.pseudo_by_name.get(name).copied()
    }

    pub fn logical(&self, id: LogId) -> &LogicalHmm {
        &self.logical[id as usize]
    }

    pub fn physical(&self, id: PhysId) -> &PhysicalHmm {
        &self.physical[id as usize]
    }

    pub fn state(&self, id: StateId) -> &HmmState {
        &self.states[id as usize]
    }

    pub fn pseudo_phone(&self, id: PseudoId) -> &PseudoPhone {
        &self.pseudo[id as usize]
    }

    /// Look up a logical model, creating a pseudo phone on the fly when the
    /// name is not defined but matching triphones exist.
    pub fn logical_or_pseudo(&mut self, name: &str) -> Option<LogId> {
        if let Some(id) = self.logical_id(name) {
            return Some(id);
        }
        let pid = self.make_pseudo(name)?;
        let id = self.logical.len() as LogId;
        self.logical.push(LogicalHmm {
            name: name.to_string(),
            body: LogicalBody::Pseudo(pid),
        });
        self.log_by_name.insert(name.to_string(), id);
        Some(id)
    }

    /// Build (or fetch) a pseudo phone covering every defined model whose
    /// name matches the known part of `name`.
    pub fn make_pseudo(&mut self, name: &str) -> Option<PseudoId> {
        if let Some(&id) = self.pseudo_by_name.get(name) {
            return Some(id);
        }
        let pattern = PhoneName::parse(name);
        let mut members: Vec<PhysId> = Vec::new();
        for (pid, phys) in self.physical.iter().enumerate() {
            let cand = PhoneName::parse(&phys.name);
            if pattern.subsumes(&cand) {
                members.push(pid as PhysId);
            }
        }
        if members.is_empty() {
            return None;
        }
        let nstate = self.physical[members[0] as usize].states.len();
        if members
            .iter()
            .any(|&p| self.physical[p as usize].states.len() != nstate)
        {
            log::warn!(
                "pseudo phone {}: member models differ in state count, using shortest",
                name
            );
        }
        let nstate = members
            .iter()
            .map(|&p| self.physical[p as usize].states.len())
            .min()
            .unwrap();
        // representative must have exactly the shared state count so its
        // transition shape stays applicable
        let repr = members
            .iter()
            .copied()
            .find(|&p| self.physical[p as usize].states.len() == nstate)
            .unwrap();
        let mut state_sets = vec![Vec::new(); nstate];
        for &p in &members {
            for (loc, &sid) in self.physical[p as usize].states[..nstate].iter().enumerate() {
                if !state_sets[loc].contains(&sid) {
                    state_sets[loc].push(sid);
                }
            }
        }
        let id = self.pseudo.len() as PseudoId;
        self.pseudo.push(PseudoPhone {
            name: name.to_string(),
            state_sets,
            repr,
        });
        self.pseudo_by_name.insert(name.to_string(), id);
        Some(id)
    }

    /// Validate that every physical reference resolves; called after load.
    pub fn check(&self) -> Result<(), ModelError> {
        for phys in &self.physical {
            for &s in &phys.states {
                if s as usize >= self.states.len() {
                    return Err(ModelError::UndefinedReference(format!(
                        "model {}: state id {} out of range",
                        phys.name, s
                    )));
                }
            }
        }
        for state in &self.states {
            for pdf in &state.streams {
                if pdf.weights.len() != pdf.dens.len() {
                    return Err(ModelError::Format(
                        "mixture weight/density count mismatch".into(),
                    ));
                }
                for &d in &pdf.dens {
                    if d as usize >= self.dens.len() {
                        return Err(ModelError::UndefinedReference(format!(
                            "density id {} out of range",
                            d
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parsed HTK context-dependent phone name `left-center+right`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoneName<'a> {
    pub left: Option<&'a str>,
    pub center: &'a str,
    pub right: Option<&'a str>,
}

impl<'a> PhoneName<'a> {
    pub fn parse(name: &'a str) -> Self {
        let (left, rest) = match name.find('-') {
            Some(i) => (Some(&name[..i]), &name[i + 1..]),
            None => (None, name),
        };
        let (center, right) = match rest.find('+') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };
        Self {
            left,
            center,
            right,
        }
    }

    /// True when every context this pattern specifies matches `other`.
    pub fn subsumes(&self, other: &PhoneName) -> bool {
        if self.center != other.center {
            return false;
        }
        if let Some(l) = self.left {
            if other.left != Some(l) {
                return false;
            }
        }
        if let Some(r) = self.right {
            if other.right != Some(r) {
                return false;
            }
        }
        true
    }
}

/// Base (center) phone of a context-dependent name.
pub fn center_name(name: &str) -> &str {
    PhoneName::parse(name).center
}

/// `left-center` part of a name, dropping the right context.
pub fn leftcenter_name(name: &str) -> String {
    let p = PhoneName::parse(name);
    match p.left {
        Some(l) => format!("{}-{}", l, p.center),
        None => p.center.to_string(),
    }
}

/// `center+right` part of a name, dropping the left context.
pub fn centerright_name(name: &str) -> String {
    let p = PhoneName::parse(name);
    match p.right {
        Some(r) => format!("{}+{}", p.center, r),
        None => p.center.to_string(),
    }
}

/// Attach (or replace) the left context of a name.
pub fn add_left_context(name: &str, left: &str) -> String {
    let p = PhoneName::parse(name);
    match p.right {
        Some(r) => format!("{}-{}+{}", left, p.center, r),
        None => format!("{}-{}", left, p.center),
    }
}

/// Attach (or replace) the right context of a name.
pub fn add_right_context(name: &str, right: &str) -> String {
    let p = PhoneName::parse(name);
    match p.left {
        Some(l) => format!("{}-{}+{}", l, p.center, right),
        None => format!("{}+{}", p.center, right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_name_parsing() {
        let p = PhoneName::parse("a-k+i");
        assert_eq!(p.left, Some("a"));
        assert_eq!(p.center, "k");
        assert_eq!(p.right, Some("i"));

        let p = PhoneName::parse("k+i");
        assert_eq!(p.left, None);
        assert_eq!(p.center, "k");
        assert_eq!(p.right, Some("i"));

        let p = PhoneName::parse("sil");
        assert_eq!((p.left, p.center, p.right), (None, "sil", None));
    }

    #[test]
    fn name_composition() {
        assert_eq!(add_left_context("k+i", "a"), "a-k+i");
        assert_eq!(add_right_context("a-k", "i"), "a-k+i");
        assert_eq!(add_left_context("k", "a"), "a-k");
        assert_eq!(leftcenter_name("a-k+i"), "a-k");
        assert_eq!(centerright_name("a-k+i"), "k+i");
        assert_eq!(center_name("a-k+i"), "k");
    }

    #[test]
    fn add_log_probs_behaves() {
        let a: f32 = (0.25f32).ln();
        let b: f32 = (0.25f32).ln();
        let sum = add_log_probs(a, b);
        assert!((sum - (0.5f32).ln()).abs() < 1e-5);
        assert_eq!(add_log_probs(LOG_ZERO, a), a);
        assert_eq!(add_log_probs(a, LOG_ZERO), a);
    }

    #[test]
    fn gconst_matches_definition() {
        let g = Gaussian::from_variance(vec![0.0, 0.0], vec![1.0, 1.0]);
        let expect = 2.0 * (2.0 * std::f32::consts::PI).ln();
        assert!((g.gconst - expect).abs() < 1e-5);
        assert_eq!(g.inv_var, vec![1.0, 1.0]);
    }

    fn three_state_trans() -> TransMatrix {
        // entry, 3 emitting, exit
        let mut t = TransMatrix::new(5);
        t.set(0, 1, 0.0);
        for i in 1..4 {
            t.set(i, i, (0.6f32).ln());
            t.set(i, i + 1, (0.4f32).ln());
        }
        t
    }

    #[test]
    fn multipath_detection() {
        let t = three_state_trans();
        assert!(!t.is_multipath());

        let mut skip = three_state_trans();
        skip.set(1, 3, (0.1f32).ln());
        assert!(skip.is_multipath());
    }

    #[test]
    fn pseudo_phone_collects_matching_triphones() {
        let mut set = HmmSet::new(2);
        let d = set.add_density(Gaussian::from_variance(vec![0.0, 0.0], vec![1.0, 1.0]));
        let s = set.add_state(HmmState {
            streams: vec![MixturePdf {
                weights: vec![0.0],
                dens: vec![d],
            }],
            stream_weights: vec![1.0],
        });
        for name in ["a-k+i", "a-k+u", "e-k+i"] {
            let t = set.add_transition(three_state_trans());
            set.add_physical(name, vec![s, s, s], t).unwrap();
        }
        set.define_logical_from_physical();

        let p = set.make_pseudo("a-k").unwrap();
        assert_eq!(set.pseudo_phone(p).state_sets.len(), 3);
        // shared state appears once per position
        assert_eq!(set.pseudo_phone(p).state_sets[0], vec![s]);

        assert!(set.make_pseudo("x-q").is_none());

        let l = set.logical_or_pseudo("k+i").unwrap();
        assert!(set.logical(l).is_pseudo());
    }
}
