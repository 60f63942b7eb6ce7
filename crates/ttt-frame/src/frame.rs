//! The event frame: one member's events in one tree under one active variation.

use std::collections::{BTreeMap, HashMap};

use ttt_core::{Error, Result};

use crate::expr::{CompiledExpr, VarRef};
use crate::jagged::{Jagged, WeightTable};
use crate::ntuple::MemberMeta;
use crate::source::{Column, EventSource, ShiftKind};

/// How a member's weights are normalised.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceKind {
    /// Simulated sample, scaled by `xsec_scale / Σ generator weights`.
    Simulation {
        /// Cross section × luminosity (× k-factor) in events.
        xsec_scale: f64,
    },
    /// Collision data: weights are identically 1.
    Data,
    /// Data-driven estimate: stored weights are used as-is.
    DataDriven,
}

impl SourceKind {
    /// `true` for collision data.
    pub fn is_data(self) -> bool {
        matches!(self, SourceKind::Data)
    }
}

/// Knobs shared by every frame of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOptions {
    /// Variation-name prefixes that switch jet pt/mass to the shifted tables.
    pub jec_prefixes: Vec<String>,
    /// Fraction of the generator sum of weights below which a variation's own
    /// sum is ignored.
    pub sumweight_floor: f64,
}

impl Default for FrameOptions {
    fn default() -> Self {
        Self { jec_prefixes: vec!["Jet_JE".to_string()], sumweight_floor: 0.1 }
    }
}

/// Which particle(s) of a collection to read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParticleIndex {
    /// Every selected particle, flattened; event weights are broadcast.
    All,
    /// The i-th particle; events with fewer particles are dropped.
    At(usize),
    /// The i-th particle; events with fewer particles get the pad value.
    Padded(usize, f64),
}

/// Values with their weights, ready to be filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fill {
    /// One value per entry.
    pub values: Vec<f64>,
    /// One weight per entry.
    pub weights: Vec<f64>,
}

impl Fill {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// `true` when there is nothing to fill.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Particle collection kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    /// Stored in the tree.
    Single(String),
    /// Union of stored collections, sorted by descending pt.
    Merged {
        /// Name of the merged view.
        name: String,
        /// Stored collections it draws from.
        parts: Vec<String>,
    },
}

/// Uniform view of one member's selected events under a chosen variation.
///
/// Columns are read from the source the first time they are addressed and
/// kept for the life of the frame. Values derived from the active variation
/// (scalars at the active selection bit, particle masks, shifted jet
/// kinematics) are dropped on every [`set_variation`](Self::set_variation).
pub struct EventFrame {
    source: Box<dyn EventSource>,
    meta: MemberMeta,
    member: String,
    tree: String,
    kind: SourceKind,
    options: FrameOptions,

    variation: String,
    column: usize,
    bit: usize,
    jec_active: bool,
    correct_syst: bool,

    raw_weights: Option<WeightTable>,
    raw_pass: Option<Vec<u64>>,
    raw_scalars: HashMap<String, Column>,
    raw_fields: HashMap<(String, String), Jagged<f64>>,
    raw_bitmaps: HashMap<String, Option<Jagged<u64>>>,
    raw_shifts: HashMap<(String, ShiftKind), Jagged<Vec<f64>>>,

    base_mask: Vec<bool>,
    mask: Vec<bool>,
    weight: Vec<f64>,
    merged: BTreeMap<String, Vec<String>>,
    particle_masks: HashMap<String, Jagged<bool>>,
    scalar_cache: HashMap<String, Vec<f64>>,
    field_cache: HashMap<(String, String), Jagged<f64>>,
}

impl std::fmt::Debug for EventFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFrame")
            .field("source", &self.source.describe())
            .field("member", &self.member)
            .field("tree", &self.tree)
            .field("variation", &self.variation)
            .field("correct_syst", &self.correct_syst)
            .finish()
    }
}

impl EventFrame {
    /// Open a frame and switch it to `initial_variation`.
    ///
    /// An unknown initial variation does not fail: the frame is returned with
    /// [`is_valid`](Self::is_valid) false.
    pub fn open(
        source: Box<dyn EventSource>,
        meta: MemberMeta,
        member: &str,
        tree: &str,
        kind: SourceKind,
        options: FrameOptions,
        initial_variation: &str,
    ) -> Result<Self> {
        meta.validate()?;
        let mut frame = EventFrame {
            source,
            meta,
            member: member.to_string(),
            tree: tree.to_string(),
            kind,
            options,
            variation: String::new(),
            column: 0,
            bit: 0,
            jec_active: false,
            correct_syst: false,
            raw_weights: None,
            raw_pass: None,
            raw_scalars: HashMap::new(),
            raw_fields: HashMap::new(),
            raw_bitmaps: HashMap::new(),
            raw_shifts: HashMap::new(),
            base_mask: Vec::new(),
            mask: Vec::new(),
            weight: Vec::new(),
            merged: BTreeMap::new(),
            particle_masks: HashMap::new(),
            scalar_cache: HashMap::new(),
            field_cache: HashMap::new(),
        };
        frame.set_variation(initial_variation)?;
        Ok(frame)
    }

    // ── identity ───────────────────────────────────────────────

    /// Member name.
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Tree name.
    pub fn tree(&self) -> &str {
        &self.tree
    }

    /// Normalisation kind.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Member metadata.
    pub fn meta(&self) -> &MemberMeta {
        &self.meta
    }

    /// Active variation name.
    pub fn variation(&self) -> &str {
        &self.variation
    }

    /// Active selection bit.
    pub fn bit(&self) -> usize {
        self.bit
    }

    /// `false` when the last requested variation is not stored for this member.
    pub fn is_valid(&self) -> bool {
        self.correct_syst
    }

    /// Whether `name` is one of this member's weight columns.
    pub fn supports(&self, variation: &str) -> bool {
        self.meta.column_of(variation).is_some()
    }

    /// Total number of events in the tree.
    pub fn n_events(&self) -> usize {
        self.source.n_events()
    }

    /// Number of events passing the current mask.
    pub fn n_selected(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    /// Whether the source stores a scalar column.
    pub fn has_column(&self, name: &str) -> bool {
        self.source.has_column(name)
    }

    /// Whether a collection (stored or merged) exists.
    pub fn has_collection(&self, name: &str) -> bool {
        self.merged.contains_key(name) || self.source.has_collection(name)
    }

    /// Whether the collection has jet-energy shift tables.
    pub fn has_jec_shift(&self, name: &str) -> bool {
        self.source.has_jec_shift(name)
    }

    /// The collection behind `name`.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        if let Some(parts) = self.merged.get(name) {
            return Ok(Collection::Merged { name: name.to_string(), parts: parts.clone() });
        }
        if self.source.has_collection(name) {
            return Ok(Collection::Single(name.to_string()));
        }
        Err(Error::Validation(format!(
            "unknown collection '{name}' in {}",
            self.source.describe()
        )))
    }

    // ── variation switching ────────────────────────────────────

    /// Switch the active variation.
    ///
    /// Resets the event mask to `PassEvent & (1 << bit)`, loads weight column
    /// `W[:, column]` with its normalisation, switches jet kinematics for
    /// jet-energy variations and drops every variation-dependent cache.
    /// Returns `false` (and disables the frame) when the member does not
    /// store this variation.
    pub fn set_variation(&mut self, name: &str) -> Result<bool> {
        self.scalar_cache.clear();
        self.field_cache.clear();
        self.particle_masks.clear();
        self.variation = name.to_string();
        let n = self.source.n_events();

        let Some(column) = self.meta.column_of(name) else {
            tracing::debug!(member = %self.member, tree = %self.tree, variation = name, "variation not stored");
            self.correct_syst = false;
            self.jec_active = false;
            self.base_mask = vec![false; n];
            self.mask = self.base_mask.clone();
            self.weight = vec![0.0; n];
            return Ok(false);
        };
        let bit = self.meta.bit_of(column);
        if bit >= 64 {
            return Err(Error::Validation(format!("selection bit {bit} of '{name}' out of range")));
        }

        let raw = match self.raw_weights.take() {
            Some(w) => w,
            None => self.source.weights()?,
        };
        let raw = self.raw_weights.insert(raw);
        if raw.n_events() != n {
            return Err(Error::MissingInput(format!(
                "weight table of {} has {} events, tree has {n}",
                self.source.describe(),
                raw.n_events()
            )));
        }
        self.weight = match self.kind {
            SourceKind::Data => vec![1.0; n],
            SourceKind::DataDriven => raw.column(column)?,
            SourceKind::Simulation { xsec_scale } => {
                let sumw = self.meta.sumweight_for(name, self.options.sumweight_floor)?;
                let factor = xsec_scale / sumw;
                raw.column(column)?.into_iter().map(|w| w * factor).collect()
            }
        };

        let pass = match self.raw_pass.take() {
            Some(p) => p,
            None => self.source.pass_event()?,
        };
        let pass = self.raw_pass.insert(pass);
        if pass.len() != n {
            return Err(Error::MissingInput(format!(
                "PassEvent of {} has {} entries, tree has {n}",
                self.source.describe(),
                pass.len()
            )));
        }
        let flag = 1u64 << bit;
        self.base_mask = pass.iter().map(|p| p & flag != 0).collect();
        self.mask = self.base_mask.clone();

        self.column = column;
        self.bit = bit;
        self.jec_active = bit > 0 && self.options.jec_prefixes.iter().any(|p| name.starts_with(p));
        self.correct_syst = true;
        tracing::trace!(
            member = %self.member,
            tree = %self.tree,
            variation = name,
            column,
            bit,
            selected = self.n_selected(),
            "variation set"
        );
        Ok(true)
    }

    // ── masks ──────────────────────────────────────────────────

    /// Conjoin a predicate over the currently selected events.
    pub fn mask(&mut self, predicate: &[bool]) -> Result<()> {
        let n_sel = self.n_selected();
        if predicate.len() != n_sel {
            return Err(Error::Validation(format!(
                "mask has {} entries, {n_sel} events selected",
                predicate.len()
            )));
        }
        let mut it = predicate.iter();
        for m in self.mask.iter_mut().filter(|m| **m) {
            if let Some(keep) = it.next() {
                *m = *keep;
            }
        }
        Ok(())
    }

    /// Conjoin an expression (true where the value is > 0).
    pub fn mask_expr(&mut self, expr: &CompiledExpr) -> Result<()> {
        let vals = self.eval(expr)?;
        let pred: Vec<bool> = vals.iter().map(|v| *v > 0.0).collect();
        self.mask(&pred)
    }

    /// Restore the active variation's natural mask.
    pub fn reset_mask(&mut self) {
        self.mask = self.base_mask.clone();
    }

    /// Event mask over all events.
    pub fn event_mask(&self) -> &[bool] {
        &self.mask
    }

    // ── weights ────────────────────────────────────────────────

    /// Active weights of the selected events.
    pub fn weights(&self) -> Vec<f64> {
        self.weight.iter().zip(&self.mask).filter(|(_, m)| **m).map(|(w, _)| *w).collect()
    }

    /// Multiply the weight of every selected event by its factor.
    pub fn scale(&mut self, factors: &[f64]) -> Result<()> {
        let n_sel = self.n_selected();
        if factors.len() != n_sel {
            return Err(Error::Validation(format!(
                "scale has {} factors, {n_sel} events selected",
                factors.len()
            )));
        }
        let mut it = factors.iter();
        for (w, _) in self.weight.iter_mut().zip(&self.mask).filter(|(_, m)| **m) {
            if let Some(f) = it.next() {
                *w *= f;
            }
        }
        Ok(())
    }

    /// Multiply only the selected events where `submask` is true.
    ///
    /// `submask` has one entry per selected event. `factors` has either one
    /// entry per `true` in `submask` (consumed in order) or one entry per
    /// selected event.
    pub fn scale_where(&mut self, factors: &[f64], submask: &[bool]) -> Result<()> {
        let n_sel = self.n_selected();
        if submask.len() != n_sel {
            return Err(Error::Validation(format!(
                "scale submask has {} entries, {n_sel} events selected",
                submask.len()
            )));
        }
        let n_true = submask.iter().filter(|m| **m).count();
        let compact = factors.len() == n_true;
        if !compact && factors.len() != n_sel {
            return Err(Error::Validation(format!(
                "scale has {} factors, submask selects {n_true} of {n_sel} events",
                factors.len()
            )));
        }
        let mut k = 0;
        let selected = self.weight.iter_mut().zip(&self.mask).filter(|(_, m)| **m);
        for (i, ((w, _), sub)) in selected.zip(submask).enumerate() {
            if *sub {
                *w *= if compact { factors[k] } else { factors[i] };
                k += 1;
            }
        }
        Ok(())
    }

    /// Multiply every selected event by one factor.
    pub fn scale_all(&mut self, factor: f64) {
        for (w, _) in self.weight.iter_mut().zip(&self.mask).filter(|(_, m)| **m) {
            *w *= factor;
        }
    }

    // ── scalar columns ─────────────────────────────────────────

    fn scalar_all(&mut self, name: &str) -> Result<Vec<f64>> {
        if let Some(v) = self.scalar_cache.get(name) {
            return Ok(v.clone());
        }
        if !self.raw_scalars.contains_key(name) {
            let col = self.source.scalar(name)?;
            self.raw_scalars.insert(name.to_string(), col);
        }
        let vals = self.raw_scalars[name].at_bit(name, self.bit)?;
        if vals.len() != self.source.n_events() {
            return Err(Error::MissingInput(format!(
                "column '{name}' has {} entries, tree has {}",
                vals.len(),
                self.source.n_events()
            )));
        }
        self.scalar_cache.insert(name.to_string(), vals.clone());
        Ok(vals)
    }

    fn select<T: Copy>(&self, all: &[T]) -> Vec<T> {
        all.iter().zip(&self.mask).filter(|(_, m)| **m).map(|(v, _)| *v).collect()
    }

    /// Scalar column of the selected events, read at the active selection bit.
    pub fn column(&mut self, name: &str) -> Result<Vec<f64>> {
        let all = self.scalar_all(name)?;
        Ok(self.select(&all))
    }

    /// Evaluate an expression over the selected events.
    pub fn eval(&mut self, expr: &CompiledExpr) -> Result<Vec<f64>> {
        let mut cols: Vec<Vec<f64>> = Vec::with_capacity(expr.required_vars.len());
        for var in &expr.required_vars {
            let col = match var {
                VarRef::Column(name) => self.column(name)?,
                VarRef::Particle { collection, field, index } => {
                    self.particle(collection, field, ParticleIndex::Padded(*index, f64::NAN))?.values
                }
                VarRef::Count(collection) => {
                    self.num(collection)?.into_iter().map(|n| n as f64).collect()
                }
            };
            cols.push(col);
        }
        let refs: Vec<&[f64]> = cols.iter().map(Vec::as_slice).collect();
        expr.eval_bulk(self.n_selected(), &refs)
    }

    /// Pair per-event values of the selected events with their weights.
    pub fn event_fill(&self, values: Vec<f64>) -> Result<Fill> {
        let weights = self.weights();
        if values.len() != weights.len() {
            return Err(Error::Validation(format!(
                "{} values for {} selected events",
                values.len(),
                weights.len()
            )));
        }
        Ok(Fill { values, weights })
    }

    // ── particles ──────────────────────────────────────────────

    fn stored_field(&mut self, coll: &str, field: &str) -> Result<Jagged<f64>> {
        if !self.source.has_collection(coll) {
            return Err(Error::Validation(format!(
                "unknown collection '{coll}' in {}",
                self.source.describe()
            )));
        }
        if !self.source.has_field(coll, field) {
            return Err(Error::Validation(format!(
                "unknown field '{field}' on collection '{coll}' in {}",
                self.source.describe()
            )));
        }
        let key = (coll.to_string(), field.to_string());
        if !self.raw_fields.contains_key(&key) {
            let j = self.source.field(coll, field)?;
            self.raw_fields.insert(key.clone(), j);
        }
        let raw = &self.raw_fields[&key];

        let shift_kind = match field {
            "pt" => Some(ShiftKind::Pt),
            "mass" => Some(ShiftKind::Mass),
            _ => None,
        };
        let Some(kind) = shift_kind.filter(|k| self.jec_active && self.source.has_shift(coll, *k))
        else {
            return Ok(raw.clone());
        };

        let skey = (coll.to_string(), kind);
        if !self.raw_shifts.contains_key(&skey) {
            let s = self.source.shift(coll, kind)?;
            self.raw_shifts.insert(skey.clone(), s);
        }
        let shifts = &self.raw_shifts[&skey];
        let raw = &self.raw_fields[&key];
        if shifts.offsets() != raw.offsets() {
            return Err(Error::MissingInput(format!(
                "'{coll}/{}' does not match the '{coll}/{field}' layout",
                kind.column_field()
            )));
        }
        let idx = self.bit - 1;
        let values = shifts
            .values()
            .iter()
            .map(|s| {
                s.get(idx).copied().ok_or_else(|| {
                    Error::MissingInput(format!(
                        "'{coll}/{}' has {} entries per particle, index {idx} needed for '{}'",
                        kind.column_field(),
                        s.len(),
                        self.variation
                    ))
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        Jagged::from_parts(raw.offsets().to_vec(), values)
    }

    fn broadcast(j: &Jagged<f64>, per_event: &[f64], f: impl Fn(f64, f64) -> f64) -> Result<Jagged<f64>> {
        let mut values = Vec::with_capacity(j.values().len());
        for (row, e) in j.rows().zip(per_event) {
            values.extend(row.iter().map(|v| f(*v, *e)));
        }
        Jagged::from_parts(j.offsets().to_vec(), values)
    }

    /// Stored or derived field of every particle (before particle masks).
    fn unmasked_field(&mut self, coll: &str, field: &str) -> Result<Jagged<f64>> {
        match field {
            "abseta" => Ok(self.stored_field(coll, "eta")?.map(|e| e.abs())),
            "px" => {
                let pt = self.stored_field(coll, "pt")?;
                pt.zip_with(&self.stored_field(coll, "phi")?, |pt, phi| pt * phi.cos())
            }
            "py" => {
                let pt = self.stored_field(coll, "pt")?;
                pt.zip_with(&self.stored_field(coll, "phi")?, |pt, phi| pt * phi.sin())
            }
            "pz" => {
                let pt = self.stored_field(coll, "pt")?;
                pt.zip_with(&self.stored_field(coll, "eta")?, |pt, eta| pt * eta.sinh())
            }
            "energy" => {
                let pt = self.stored_field(coll, "pt")?;
                let eta = self.stored_field(coll, "eta")?;
                let mass = self.stored_field(coll, "mass")?;
                let p = pt.zip_with(&eta, |pt, eta| pt * eta.cosh())?;
                p.zip_with(&mass, |p, m| (m * m + p * p).sqrt())
            }
            "mt" => {
                let pt = self.stored_field(coll, "pt")?;
                let phi = self.stored_field(coll, "phi")?;
                let met = self.scalar_all("Met")?;
                let met_phi = self.scalar_all("Met_phi")?;
                let dphi = Self::broadcast(&phi, &met_phi, |phi, mphi| 1.0 - (phi - mphi).cos())?;
                let ptm = Self::broadcast(&pt, &met, |pt, met| 2.0 * pt * met)?;
                ptm.zip_with(&dphi, |a, b| (a * b).sqrt())
            }
            _ => self.stored_field(coll, field),
        }
    }

    fn particle_mask(&mut self, coll: &str) -> Result<Jagged<bool>> {
        if let Some(m) = self.particle_masks.get(coll) {
            return Ok(m.clone());
        }
        if !self.raw_bitmaps.contains_key(coll) {
            let b = self.source.bitmap(coll)?;
            self.raw_bitmaps.insert(coll.to_string(), b);
        }
        let flag = 1u64 << self.bit;
        let mask = match &self.raw_bitmaps[coll] {
            Some(bits) => bits.map(|b| b & flag != 0),
            None => self.stored_field(coll, "pt")?.map(|_| true),
        };
        self.particle_masks.insert(coll.to_string(), mask.clone());
        Ok(mask)
    }

    fn single_particles(&mut self, coll: &str, field: &str) -> Result<Jagged<f64>> {
        let values = self.unmasked_field(coll, field)?;
        let mask = self.particle_mask(coll)?;
        values.filter(&mask)
    }

    /// Particle-masked (and for merged views, pt-sorted) values over all events.
    fn particles_all(&mut self, coll: &str, field: &str) -> Result<Jagged<f64>> {
        let key = (coll.to_string(), field.to_string());
        if let Some(j) = self.field_cache.get(&key) {
            return Ok(j.clone());
        }
        let out = match self.collection(coll)? {
            Collection::Single(name) => self.single_particles(&name, field)?,
            Collection::Merged { parts, .. } => {
                let mut vals = Vec::with_capacity(parts.len());
                let mut pts = Vec::with_capacity(parts.len());
                for p in &parts {
                    vals.push(self.single_particles(p, field)?);
                    pts.push(self.single_particles(p, "pt")?);
                }
                let n = self.source.n_events();
                let mut offsets = Vec::with_capacity(n + 1);
                let mut values = Vec::new();
                offsets.push(0);
                let mut row: Vec<(f64, f64)> = Vec::new();
                for e in 0..n {
                    row.clear();
                    for (v, pt) in vals.iter().zip(&pts) {
                        row.extend(pt.row(e).iter().copied().zip(v.row(e).iter().copied()));
                    }
                    row.sort_by(|a, b| b.0.total_cmp(&a.0));
                    values.extend(row.iter().map(|(_, v)| *v));
                    offsets.push(values.len());
                }
                Jagged::from_parts(offsets, values)?
            }
        };
        self.field_cache.insert(key, out.clone());
        Ok(out)
    }

    /// Per-event particle lists of the selected events.
    pub fn jagged(&mut self, coll: &str, field: &str) -> Result<Jagged<f64>> {
        self.particles_all(coll, field)?.select_events(&self.mask)
    }

    /// Per-event particle count of the selected events.
    pub fn num(&mut self, coll: &str) -> Result<Vec<usize>> {
        let counts = match self.collection(coll)? {
            Collection::Single(name) => self
                .particle_mask(&name)?
                .rows()
                .map(|row| row.iter().filter(|b| **b).count())
                .collect(),
            Collection::Merged { parts, .. } => {
                let mut total = vec![0usize; self.source.n_events()];
                for p in &parts {
                    let m = self.particle_mask(p)?;
                    for (t, row) in total.iter_mut().zip(m.rows()) {
                        *t += row.iter().filter(|b| **b).count();
                    }
                }
                total
            }
        };
        Ok(self.select(&counts))
    }

    /// Field values of the selected particles, with weights, as
    /// `frame[collection][field, i, pad]`.
    pub fn particle(&mut self, coll: &str, field: &str, index: ParticleIndex) -> Result<Fill> {
        let vals = self.jagged(coll, field)?;
        let w = self.weights();
        let mut fill = Fill::default();
        match index {
            ParticleIndex::All => {
                for (row, w) in vals.rows().zip(&w) {
                    fill.values.extend_from_slice(row);
                    fill.weights.extend(std::iter::repeat_n(*w, row.len()));
                }
            }
            ParticleIndex::At(i) => {
                for (row, w) in vals.rows().zip(&w) {
                    if let Some(v) = row.get(i) {
                        fill.values.push(*v);
                        fill.weights.push(*w);
                    }
                }
            }
            ParticleIndex::Padded(i, pad) => {
                for (row, w) in vals.rows().zip(&w) {
                    fill.values.push(row.get(i).copied().unwrap_or(pad));
                    fill.weights.push(*w);
                }
            }
        }
        Ok(fill)
    }

    /// Restrict a collection's particles with a predicate on one field.
    ///
    /// Independent of the event mask; reset by [`set_variation`](Self::set_variation).
    /// On a merged view the predicate is applied to every part.
    pub fn mask_particles(&mut self, coll: &str, field: &str, pred: impl Fn(f64) -> bool) -> Result<()> {
        let parts = match self.collection(coll)? {
            Collection::Single(name) => vec![name],
            Collection::Merged { parts, .. } => parts,
        };
        for p in &parts {
            let values = self.unmasked_field(p, field)?;
            let mask = self.particle_mask(p)?;
            let refined = mask.zip_with(&values, |m, v| *m && pred(*v))?;
            self.particle_masks.insert(p.clone(), refined);
        }
        self.field_cache.clear();
        Ok(())
    }

    /// Present stored collections as one collection sorted by descending pt.
    pub fn merge(&mut self, name: &str, parts: &[&str]) -> Result<()> {
        if self.has_collection(name) {
            return Err(Error::Validation(format!("collection '{name}' already exists")));
        }
        if parts.is_empty() {
            return Err(Error::Validation(format!("merged collection '{name}' has no parts")));
        }
        for p in parts {
            if self.merged.contains_key(*p) {
                return Err(Error::Validation(format!(
                    "cannot merge '{p}' into '{name}': it is itself a merged collection"
                )));
            }
            if !self.source.has_collection(p) {
                return Err(Error::Validation(format!(
                    "unknown collection '{p}' in {}",
                    self.source.describe()
                )));
            }
        }
        self.merged.insert(name.to_string(), parts.iter().map(|p| p.to_string()).collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CollectionData, EventTable};
    use approx::assert_relative_eq;
    use std::collections::BTreeMap;

    fn jets() -> CollectionData {
        CollectionData::new()
            .with_field("pt", Jagged::from_rows(&[vec![100.0, 40.0], vec![60.0], vec![]]))
            .with_field("eta", Jagged::from_rows(&[vec![0.5, -1.0], vec![2.0], vec![]]))
            .with_field("phi", Jagged::from_rows(&[vec![0.0, 1.0], vec![-1.0], vec![]]))
            .with_field("mass", Jagged::from_rows(&[vec![10.0, 5.0], vec![8.0], vec![]]))
            // bit 0: all jets pass; bit 1 (JER up): the 40 GeV jet fails
            .with_bitmap(Jagged::from_rows(&[vec![3u64, 1], vec![3], vec![]]))
            .with_shift(
                ShiftKind::Pt,
                Jagged::from_rows(&[vec![vec![110.0], vec![44.0]], vec![vec![66.0]], vec![]]),
            )
    }

    fn table() -> (EventTable, MemberMeta) {
        let w = WeightTable::from_columns(&[
            vec![1.0, 2.0, 3.0],
            vec![1.1, 2.2, 3.3],
            vec![1.5, 2.5, 3.5],
        ])
        .unwrap();
        let t = EventTable::new(w)
            .with_pass_event(vec![3, 1, 2])
            .with_scalar("HT", vec![150.0, 350.0, 50.0])
            .with_scalar_per_variation(
                "NJets",
                Jagged::from_rows(&[vec![2.0, 2.0], vec![1.0, 1.0], vec![0.0, 1.0]]),
            )
            .with_scalar("Met", vec![50.0, 20.0, 10.0])
            .with_scalar("Met_phi", vec![0.0, 0.0, 0.0])
            .with_collection("Jets", jets())
            .with_collection(
                "TightMuon",
                CollectionData::new()
                    .with_field("pt", Jagged::from_rows(&[vec![70.0], vec![], vec![30.0]]))
                    .with_field("eta", Jagged::from_rows(&[vec![0.1], vec![], vec![0.2]])),
            )
            .with_collection(
                "TightElectron",
                CollectionData::new()
                    .with_field("pt", Jagged::from_rows(&[vec![120.0, 20.0], vec![35.0], vec![]]))
                    .with_field("eta", Jagged::from_rows(&[vec![1.1, 1.2], vec![1.3], vec![]])),
            );
        let meta = MemberMeta::new(vec!["Nominal".into(), "PU_up".into(), "Jet_JER_up".into()])
            .with_syst_index(BTreeMap::from([(1, 0), (2, 1)]))
            .with_sumweight(vec![10.0]);
        (t, meta)
    }

    fn frame(kind: SourceKind) -> EventFrame {
        let (t, meta) = table();
        EventFrame::open(Box::new(t), meta, "ttz", "Signal_Dilepton", kind, FrameOptions::default(), "Nominal")
            .unwrap()
    }

    #[test]
    fn nominal_mask_and_normalisation() {
        let f = frame(SourceKind::Simulation { xsec_scale: 20.0 });
        assert!(f.is_valid());
        // PassEvent bit 0 set for events 0 and 1
        assert_eq!(f.n_selected(), 2);
        assert_eq!(f.weights(), vec![2.0, 4.0]);
    }

    #[test]
    fn data_weights_are_one() {
        let mut f = frame(SourceKind::Data);
        assert_eq!(f.weights(), vec![1.0, 1.0]);
        f.set_variation("PU_up").unwrap();
        assert_eq!(f.weights(), vec![1.0, 1.0]);
    }

    #[test]
    fn variation_switch_uses_bit_and_column() {
        let mut f = frame(SourceKind::DataDriven);
        assert!(f.set_variation("Jet_JER_up").unwrap());
        assert_eq!(f.bit(), 1);
        // bit 1 set for events 0 and 2
        assert_eq!(f.weights(), vec![1.5, 3.5]);
        assert_eq!(f.column("NJets").unwrap(), vec![2.0, 1.0]);
        // shifted pt, jet 2 of event 0 rejected by its bitmap
        let j = f.jagged("Jets", "pt").unwrap();
        assert_eq!(j.row(0), &[110.0]);
        assert!(j.row(1).is_empty());

        assert!(f.set_variation("PU_up").unwrap());
        assert_eq!(f.weights(), vec![1.1, 2.2]);
        assert_eq!(f.jagged("Jets", "pt").unwrap().row(0), &[100.0, 40.0]);
    }

    #[test]
    fn unknown_variation_disables_frame() {
        let mut f = frame(SourceKind::DataDriven);
        assert!(!f.set_variation("JES_up").unwrap());
        assert!(!f.is_valid());
        assert_eq!(f.n_selected(), 0);
        assert!(f.particle("Jets", "pt", ParticleIndex::All).unwrap().is_empty());
    }

    #[test]
    fn masks_and_scaling() {
        let mut f = frame(SourceKind::DataDriven);
        let cut = CompiledExpr::compile("HT > 200").unwrap();
        f.mask_expr(&cut).unwrap();
        assert_eq!(f.n_selected(), 1);
        assert_eq!(f.weights(), vec![2.0]);
        f.reset_mask();
        assert_eq!(f.n_selected(), 2);

        f.scale(&[2.0, 3.0]).unwrap();
        assert_eq!(f.weights(), vec![2.0, 6.0]);
        f.scale_where(&[10.0], &[false, true]).unwrap();
        assert_eq!(f.weights(), vec![2.0, 60.0]);
        f.scale_where(&[0.5, 7.0], &[true, false]).unwrap();
        assert_eq!(f.weights(), vec![1.0, 60.0]);
        f.scale_all(2.0);
        assert_eq!(f.weights(), vec![2.0, 120.0]);
        assert!(f.scale(&[1.0]).is_err());
        assert!(f.scale_where(&[1.0, 1.0, 1.0], &[true, false]).is_err());
    }

    #[test]
    fn particle_access_modes() {
        let mut f = frame(SourceKind::DataDriven);
        let all = f.particle("Jets", "pt", ParticleIndex::All).unwrap();
        assert_eq!(all.values, vec![100.0, 40.0, 60.0]);
        assert_eq!(all.weights, vec![1.0, 1.0, 2.0]);
        let second = f.particle("Jets", "pt", ParticleIndex::At(1)).unwrap();
        assert_eq!(second.values, vec![40.0]);
        assert_eq!(second.weights, vec![1.0]);
        let padded = f.particle("Jets", "pt", ParticleIndex::Padded(1, -1.0)).unwrap();
        assert_eq!(padded.values, vec![40.0, -1.0]);
        assert_eq!(f.num("Jets").unwrap(), vec![2, 1]);
    }

    #[test]
    fn derived_fields() {
        let mut f = frame(SourceKind::DataDriven);
        let abseta = f.particle("Jets", "abseta", ParticleIndex::At(0)).unwrap();
        assert_eq!(abseta.values, vec![0.5, 2.0]);
        let px = f.particle("Jets", "px", ParticleIndex::At(0)).unwrap();
        assert_relative_eq!(px.values[0], 100.0);
        assert_relative_eq!(px.values[1], 60.0 * (-1.0f64).cos());
        let e = f.particle("Jets", "energy", ParticleIndex::At(0)).unwrap();
        let p = 100.0 * 0.5f64.cosh();
        assert_relative_eq!(e.values[0], (100.0 + p * p).sqrt());
        let mt = f.particle("Jets", "mt", ParticleIndex::At(0)).unwrap();
        // phi == met_phi for the leading jet of event 0
        assert_relative_eq!(mt.values[0], 0.0);
    }

    #[test]
    fn particle_submask() {
        let mut f = frame(SourceKind::DataDriven);
        f.mask_particles("Jets", "pt", |pt| pt > 50.0).unwrap();
        assert_eq!(f.num("Jets").unwrap(), vec![1, 1]);
        assert_eq!(f.jagged("Jets", "pt").unwrap().row(0), &[100.0]);
        // a new variation resets particle masks
        f.set_variation("Nominal").unwrap();
        assert_eq!(f.num("Jets").unwrap(), vec![2, 1]);
    }

    #[test]
    fn merged_collection_is_sorted() {
        let mut f = frame(SourceKind::DataDriven);
        f.merge("TightLepton", &["TightMuon", "TightElectron"]).unwrap();
        let pt = f.jagged("TightLepton", "pt").unwrap();
        assert_eq!(pt.row(0), &[120.0, 70.0, 20.0]);
        assert_eq!(pt.row(1), &[35.0]);
        let eta = f.particle("TightLepton", "eta", ParticleIndex::At(0)).unwrap();
        assert_eq!(eta.values, vec![1.1, 1.3]);
        assert_eq!(f.num("TightLepton").unwrap(), vec![3, 1]);

        let cut = CompiledExpr::compile("TightLepton.n == 3 && TightLepton.pt[2] < 30").unwrap();
        assert_eq!(f.eval(&cut).unwrap(), vec![1.0, 0.0]);

        assert!(f.merge("TightLepton", &["TightMuon"]).is_err());
        assert!(f.merge("X", &["Nope"]).is_err());
    }

    #[test]
    fn unknown_field_is_an_error() {
        let mut f = frame(SourceKind::DataDriven);
        let err = f.particle("Jets", "btag", ParticleIndex::All).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.particle("Photons", "pt", ParticleIndex::All).is_err());
        assert!(matches!(f.column("Nope").unwrap_err(), Error::MissingInput(_)));
    }
}
