//! Generation orchestrator: resolve, flatten, lay out, pack, synthesize,
//! and drive the code backend.
//!
//! A `CompilationContext` is single-shot. Procedure names are checked for
//! collisions before the backend sees anything, so a failed generation
//! never leaves partial output behind.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::GenerationConfig;
use crate::diagnostics::{Diagnostic, Stage};
use crate::emit::{CodeBackend, Direction, ProcKind};
use crate::fingerprint::unit_fingerprint;
use crate::instr::{build_tree, Lowering};
use crate::items::{
    full_expand, items_for_type, Condition, PathSegment, SerializationItem,
};
use crate::layout_query::LayoutQueryCache;
use crate::options::{resolve_unit, OptionsCache, SchemaError, ShapeKind};
use crate::sectors::{pack_sectors, LayoutErrorKind, Sector};
use crate::schema::{validate_type_name, SchemaDoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateErrorKind {
    Config,
    Schema,
    SectorBudgetExceeded,
    TooManySectors,
    ProcedureNameCollision,
    AlreadyGenerated,
    NoDataRequested,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateError {
    pub kind: GenerateErrorKind,
    pub message: String,
}

impl GenerateError {
    fn new(kind: GenerateErrorKind, message: impl Into<String>) -> Self {
        GenerateError {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            GenerateErrorKind::Config => "PACKC-GEN-CONFIG",
            GenerateErrorKind::Schema => "PACKC-GEN-SCHEMA",
            GenerateErrorKind::SectorBudgetExceeded => "PACKC-PACK-SECTOR",
            GenerateErrorKind::TooManySectors => "PACKC-PACK-COUNT",
            GenerateErrorKind::ProcedureNameCollision => "PACKC-GEN-NAME",
            GenerateErrorKind::AlreadyGenerated => "PACKC-GEN-REUSED",
            GenerateErrorKind::NoDataRequested => "PACKC-GEN-EMPTY",
        }
    }
}

impl std::fmt::Display for GenerateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message)
    }
}

impl std::error::Error for GenerateError {}

/// What to generate. At least one direction must be named.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub read_proc: Option<String>,
    pub write_proc: Option<String>,
    /// Target-language type of the root value; defaults to the schema root.
    pub value_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SectorSummary {
    pub index: u32,
    pub bits_used: u64,
    pub item_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOutput {
    pub sectors: Vec<SectorSummary>,
    pub total_bits: u64,
    pub fingerprint: String,
    pub procedures: Vec<String>,
}

pub struct CompilationContext {
    pub config: GenerationConfig,
    options: OptionsCache,
    pub diagnostics: Vec<Diagnostic>,
    generated: bool,
    layout: Option<LayoutQueryCache>,
}

impl CompilationContext {
    pub fn new(config: GenerationConfig) -> Self {
        CompilationContext {
            config,
            options: OptionsCache::new(),
            diagnostics: Vec::new(),
            generated: false,
            layout: None,
        }
    }

    pub fn layout_query(&self) -> Option<&LayoutQueryCache> {
        self.layout.as_ref()
    }

    pub fn generate(
        &mut self,
        schema: &SchemaDoc,
        request: &GenerateRequest,
        backend: &mut dyn CodeBackend,
    ) -> Result<GenerateOutput, GenerateError> {
        if self.generated {
            return Err(GenerateError::new(
                GenerateErrorKind::AlreadyGenerated,
                "this compilation context has already generated output",
            ));
        }
        self.generated = true;
        if request.read_proc.is_none() && request.write_proc.is_none() {
            return Err(GenerateError::new(
                GenerateErrorKind::NoDataRequested,
                "request names neither a read nor a write procedure",
            ));
        }
        if let Err(msg) = self.config.validate() {
            self.diagnostics
                .push(Diagnostic::error("PACKC-GEN-CONFIG", Stage::Schema, msg.clone()));
            return Err(GenerateError::new(GenerateErrorKind::Config, msg));
        }
        if let Err(msg) = schema.validate() {
            self.diagnostics
                .push(Diagnostic::error("PACKC-GEN-SCHEMA", Stage::Schema, msg.clone()));
            return Err(GenerateError::new(GenerateErrorKind::Schema, msg));
        }
        if !resolve_unit(&mut self.options, &self.config, schema, &mut self.diagnostics) {
            return Err(GenerateError::new(
                GenerateErrorKind::Schema,
                "schema resolution failed",
            ));
        }

        let expanded = self
            .expand_root(schema)
            .map_err(|e| self.schema_failure(e))?;
        let sectors = pack_sectors(&self.config, &expanded).map_err(|e| {
            self.diagnostics.push(e.to_diagnostic());
            let kind = match e.kind {
                LayoutErrorKind::SectorBudgetExceeded => GenerateErrorKind::SectorBudgetExceeded,
                LayoutErrorKind::TooManySectors => GenerateErrorKind::TooManySectors,
            };
            GenerateError::new(kind, e.message)
        })?;
        if sectors.is_empty() {
            return Err(GenerateError::new(
                GenerateErrorKind::NoDataRequested,
                format!("root type {:?} serializes no data", schema.root),
            ));
        }

        let mut memo: BTreeMap<String, Vec<SerializationItem>> = BTreeMap::new();
        let mut sector_bodies: Vec<Vec<SerializationItem>> = Vec::with_capacity(sectors.len());
        for sector in &sectors {
            let rolled = self
                .reroll_structs(&mut memo, schema, &sector.items)
                .map_err(|e| self.schema_failure(e))?;
            sector_bodies.push(rolled);
        }

        // callee-before-caller order for struct procedures
        let mut struct_order: Vec<String> = Vec::new();
        let mut struct_bodies: BTreeMap<String, Vec<SerializationItem>> = BTreeMap::new();
        {
            let mut seen = BTreeSet::new();
            let roots: Vec<String> = sector_bodies
                .iter()
                .flat_map(|body| struct_types_in(body))
                .collect();
            for ty in roots {
                self.collect_struct_types(
                    &mut memo,
                    schema,
                    &ty,
                    &mut seen,
                    &mut struct_order,
                    &mut struct_bodies,
                )
                .map_err(|e| self.schema_failure(e))?;
            }
        }

        let value_type = request
            .value_type
            .clone()
            .unwrap_or_else(|| schema.root.clone());
        let plan = name_procedures(request, &sectors, &struct_order)?;

        let fingerprint = unit_fingerprint(schema, &self.config);
        let total_bits: u64 = sectors.iter().map(|s| s.bits_used()).sum();
        let config = self.config.clone();

        for dir in [Direction::Read, Direction::Write] {
            let Some(base) = plan.base(dir) else {
                continue;
            };
            let lowering = Lowering {
                config: &config,
                struct_procs: &plan.struct_procs,
            };
            for ty in &struct_order {
                let (read_proc, write_proc) = &plan.struct_procs[ty];
                let proc = match dir {
                    Direction::Read => read_proc,
                    Direction::Write => write_proc,
                };
                let tree = build_tree(&struct_bodies[ty]);
                backend.begin_procedure(proc, dir, ty, ProcKind::Struct);
                self.lower_checked(&lowering, dir, &tree, backend)?;
                backend.end_procedure();
            }
            for (sector, body) in sectors.iter().zip(&sector_bodies) {
                let proc = sector_proc_name(base, sector.index);
                let tree = build_tree(body);
                backend.begin_procedure(&proc, dir, &value_type, ProcKind::Sector);
                backend.emit_init();
                self.lower_checked(&lowering, dir, &tree, backend)?;
                backend.end_procedure();
            }
            backend.begin_procedure(base, dir, &value_type, ProcKind::Dispatcher);
            for sector in &sectors {
                backend.emit_sector_dispatch(
                    sector.index,
                    &sector_proc_name(base, sector.index),
                    sector.index == 0,
                );
            }
            backend.end_chain();
            backend.end_procedure();
        }

        self.layout = Some(LayoutQueryCache::from_sectors(&sectors));
        Ok(GenerateOutput {
            sectors: sectors
                .iter()
                .map(|s| SectorSummary {
                    index: s.index,
                    bits_used: s.bits_used(),
                    item_count: s.items.len(),
                })
                .collect(),
            total_bits,
            fingerprint,
            procedures: plan.all_names,
        })
    }

    fn expand_root(&mut self, schema: &SchemaDoc) -> Result<Vec<SerializationItem>, SchemaError> {
        let items = items_for_type(&mut self.options, &self.config, schema, &schema.root)?;
        full_expand(&mut self.options, &self.config, schema, &items)
    }

    fn schema_failure(&mut self, e: SchemaError) -> GenerateError {
        self.diagnostics.push(e.to_diagnostic(""));
        GenerateError::new(GenerateErrorKind::Schema, e.message)
    }

    fn lower_checked(
        &mut self,
        lowering: &Lowering<'_>,
        dir: Direction,
        tree: &crate::instr::Instruction,
        backend: &mut dyn CodeBackend,
    ) -> Result<(), GenerateError> {
        lowering.lower(dir, tree, backend).map_err(|msg| {
            self.diagnostics
                .push(Diagnostic::error("PACKC-GEN-LOWER", Stage::Codegen, msg.clone()));
            GenerateError::new(GenerateErrorKind::Schema, msg)
        })
    }

    fn expanded_items_for(
        &mut self,
        memo: &mut BTreeMap<String, Vec<SerializationItem>>,
        schema: &SchemaDoc,
        type_name: &str,
    ) -> Result<Vec<SerializationItem>, SchemaError> {
        if let Some(cached) = memo.get(type_name) {
            return Ok(cached.clone());
        }
        let items = items_for_type(&mut self.options, &self.config, schema, type_name)?;
        let expanded = full_expand(&mut self.options, &self.config, schema, &items)?;
        memo.insert(type_name.to_string(), expanded.clone());
        Ok(expanded)
    }

    /// Collapse runs of expanded items that exactly cover one structure
    /// value back into a single structure item, so the synthesizer can emit
    /// a call to the shared per-type procedure instead of inlining it.
    fn reroll_structs(
        &mut self,
        memo: &mut BTreeMap<String, Vec<SerializationItem>>,
        schema: &SchemaDoc,
        items: &[SerializationItem],
    ) -> Result<Vec<SerializationItem>, SchemaError> {
        let mut out = Vec::new();
        let mut i = 0usize;
        while i < items.len() {
            match self.try_reroll_at(memo, schema, items, i)? {
                Some((rolled, consumed)) => {
                    out.push(rolled);
                    i += consumed;
                }
                None => {
                    out.push(items[i].clone());
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    fn try_reroll_at(
        &mut self,
        memo: &mut BTreeMap<String, Vec<SerializationItem>>,
        schema: &SchemaDoc,
        items: &[SerializationItem],
        i: usize,
    ) -> Result<Option<(SerializationItem, usize)>, SchemaError> {
        let segs = &items[i].segments;
        for p in 0..segs.len() {
            let PathSegment::Member { options, .. } = &segs[p] else {
                continue;
            };
            let ShapeKind::Structure { type_name } = &options.shape else {
                continue;
            };
            if options.omitted || options.pad_bits.is_some() {
                continue;
            }
            let end = p + 1 + options.extents.len();
            if end > segs.len() {
                continue;
            }
            if !segs[p + 1..end]
                .iter()
                .all(|s| matches!(s, PathSegment::Slice { count: 1, .. }))
            {
                continue;
            }
            let prefix = segs[..end].to_vec();
            let expected = self.expanded_items_for(memo, schema, type_name)?;
            if expected.is_empty() {
                continue;
            }
            if let Some(rolled) = match_struct_run(items, i, &prefix, &expected) {
                return Ok(Some((rolled, expected.len())));
            }
        }
        Ok(None)
    }

    fn collect_struct_types(
        &mut self,
        memo: &mut BTreeMap<String, Vec<SerializationItem>>,
        schema: &SchemaDoc,
        type_name: &str,
        seen: &mut BTreeSet<String>,
        order: &mut Vec<String>,
        bodies: &mut BTreeMap<String, Vec<SerializationItem>>,
    ) -> Result<(), SchemaError> {
        if !seen.insert(type_name.to_string()) {
            return Ok(());
        }
        let expanded = self.expanded_items_for(memo, schema, type_name)?;
        let body = self.reroll_structs(memo, schema, &expanded)?;
        for dep in struct_types_in(&body) {
            self.collect_struct_types(memo, schema, &dep, seen, order, bodies)?;
        }
        bodies.insert(type_name.to_string(), body);
        order.push(type_name.to_string());
        Ok(())
    }

    /// Machine-readable summary of this context's run.
    pub fn report(&self, output: Option<&GenerateOutput>) -> crate::diagnostics::Report {
        let mut report =
            crate::diagnostics::Report::ok().with_diagnostics(self.diagnostics.clone());
        if let Some(out) = output {
            report = report
                .with_meta("fingerprint", serde_json::json!(out.fingerprint))
                .with_meta("total_bits", serde_json::json!(out.total_bits))
                .with_meta(
                    "sectors",
                    serde_json::json!(out
                        .sectors
                        .iter()
                        .map(|s| {
                            serde_json::json!({
                                "index": s.index,
                                "bits_used": s.bits_used,
                                "items": s.item_count,
                            })
                        })
                        .collect::<Vec<_>>()),
                )
                .with_meta("procedures", serde_json::json!(out.procedures));
        }
        report
    }
}

fn name_procedures(
    request: &GenerateRequest,
    sectors: &[Sector],
    struct_order: &[String],
) -> Result<ProcedurePlan, GenerateError> {
    let mut plan = ProcedurePlan {
        read_base: request.read_proc.clone(),
        write_base: request.write_proc.clone(),
        struct_procs: BTreeMap::new(),
        all_names: Vec::new(),
    };
    for ty in struct_order {
        let read = format!(
            "{}_t_{ty}",
            plan.read_base.as_deref().unwrap_or("packc_read")
        );
        let write = format!(
            "{}_t_{ty}",
            plan.write_base.as_deref().unwrap_or("packc_write")
        );
        plan.struct_procs.insert(ty.clone(), (read, write));
    }
    let mut names = BTreeSet::new();
    let mut claim = |name: &str| -> Result<(), GenerateError> {
        validate_type_name(name).map_err(|msg| {
            GenerateError::new(
                GenerateErrorKind::ProcedureNameCollision,
                format!("procedure name {name:?}: {msg}"),
            )
        })?;
        if !names.insert(name.to_string()) {
            return Err(GenerateError::new(
                GenerateErrorKind::ProcedureNameCollision,
                format!("procedure name {name:?} is used more than once"),
            ));
        }
        Ok(())
    };
    for dir in [Direction::Read, Direction::Write] {
        let Some(base) = plan.base(dir) else { continue };
        claim(base)?;
        for sector in sectors {
            claim(&sector_proc_name(base, sector.index))?;
        }
        for (read, write) in plan.struct_procs.values() {
            claim(match dir {
                Direction::Read => read,
                Direction::Write => write,
            })?;
        }
    }
    plan.all_names = names.into_iter().collect();
    Ok(plan)
}

struct ProcedurePlan {
    read_base: Option<String>,
    write_base: Option<String>,
    /// Struct type name to its (read, write) procedure names.
    struct_procs: BTreeMap<String, (String, String)>,
    all_names: Vec<String>,
}

impl ProcedurePlan {
    fn base(&self, dir: Direction) -> Option<&str> {
        match dir {
            Direction::Read => self.read_base.as_deref(),
            Direction::Write => self.write_base.as_deref(),
        }
    }
}

fn sector_proc_name(base: &str, index: u32) -> String {
    format!("{base}_sector{index}")
}

fn struct_types_in(items: &[SerializationItem]) -> Vec<String> {
    let mut out = Vec::new();
    for item in items {
        if item.omitted {
            continue;
        }
        let Some(opts) = item.leaf_options() else {
            continue;
        };
        if let ShapeKind::Structure { type_name } = &opts.shape {
            if item.trailing_slices() >= opts.extents.len() {
                out.push(type_name.clone());
            }
        }
    }
    out
}

fn match_struct_run(
    items: &[SerializationItem],
    i: usize,
    prefix: &[PathSegment],
    expected: &[SerializationItem],
) -> Option<SerializationItem> {
    if i + expected.len() > items.len() {
        return None;
    }
    let outer_conds: Vec<Condition> = items[i]
        .conditions
        .iter()
        .filter(|c| !(c.lhs.len() > prefix.len() && c.lhs[..prefix.len()] == *prefix))
        .cloned()
        .collect();
    for (k, exp) in expected.iter().enumerate() {
        let actual = &items[i + k];
        if actual.omitted != exp.omitted || actual.defaulted != exp.defaulted {
            return None;
        }
        if actual.segments.len() != prefix.len() + exp.segments.len()
            || actual.segments[..prefix.len()] != *prefix
            || actual.segments[prefix.len()..] != exp.segments[..]
        {
            return None;
        }
        if actual.conditions.len() != outer_conds.len() + exp.conditions.len()
            || actual.conditions[..outer_conds.len()] != outer_conds[..]
        {
            return None;
        }
        for (act, exp_cond) in actual.conditions[outer_conds.len()..]
            .iter()
            .zip(&exp.conditions)
        {
            if act.rhs != exp_cond.rhs
                || act.is_else != exp_cond.is_else
                || act.lhs.len() != prefix.len() + exp_cond.lhs.len()
                || act.lhs[..prefix.len()] != *prefix
                || act.lhs[prefix.len()..] != exp_cond.lhs[..]
            {
                return None;
            }
        }
    }
    Some(SerializationItem {
        segments: prefix.to_vec(),
        conditions: outer_conds,
        omitted: false,
        defaulted: false,
    })
}
