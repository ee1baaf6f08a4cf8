//! WebAssembly module parser.
//!
//! Wraps the `wasmparser` payload iterator to extract the parts of a
//! module the analysis consumes: function signatures, locals and bodies,
//! the type table (for `call_indirect` arity resolution), globals, memory
//! and table declarations, element segments, imports and exports. Function
//! bodies are kept as raw bytes and decoded into operators on demand.

use anyhow::{Context, Result};
use wasmparser::{ExternalKind, Parser, Payload, TypeRef};

use crate::ir::types::ValType;

/// Function signature in the module's type section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncSignature {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

/// Memory declaration (Wasm MVP has at most one memory, index 0).
#[derive(Debug, Clone)]
pub struct MemoryInfo {
    pub initial_pages: u32,
    pub maximum_pages: Option<u32>,
}

/// Table declaration (Wasm MVP has at most one table, index 0).
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub initial_size: u32,
    pub max_size: Option<u32>,
}

/// A global variable declaration.
#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub val_type: ValType,
    pub mutable: bool,
}

/// An active element segment initialising the table.
#[derive(Debug, Clone)]
pub struct ElementSegment {
    /// Starting offset in the table.
    pub offset: u32,
    /// Function indices placed into the table starting at `offset`.
    pub func_indices: Vec<u32>,
}

/// Kind of export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

/// An export from the module.
#[derive(Debug, Clone)]
pub struct ExportInfo {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// Kind of import.
#[derive(Debug, Clone)]
pub enum ImportKind {
    /// Imported function (index into the type section).
    Function(u32),
    /// Imported global.
    Global { val_type: ValType, mutable: bool },
    /// Imported memory.
    Memory,
    /// Imported table.
    Table,
}

/// An import from the host environment.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub module_name: String,
    pub name: String,
    pub kind: ImportKind,
}

/// A single local function: its type, declared locals and body bytes.
#[derive(Debug, Clone)]
pub struct ParsedFunction {
    /// Index into the type section.
    pub type_idx: u32,
    /// Declared local types (parameters live in the function type).
    pub locals: Vec<ValType>,
    /// Function body bytecode, decoded lazily.
    pub body: Vec<u8>,
}

/// Parsed WebAssembly module.
#[derive(Debug, Clone, Default)]
pub struct ParsedModule {
    /// Type section signatures.
    pub types: Vec<FuncSignature>,
    /// Local (non-imported) functions.
    pub functions: Vec<ParsedFunction>,
    pub memory: Option<MemoryInfo>,
    pub table: Option<TableInfo>,
    pub element_segments: Vec<ElementSegment>,
    /// Local globals, after the imported ones in the index space.
    pub globals: Vec<GlobalInfo>,
    pub exports: Vec<ExportInfo>,
    pub imports: Vec<ImportInfo>,
    /// Imported functions occupy indices `0..num_imported_functions`.
    pub num_imported_functions: u32,
    pub num_imported_globals: u32,
}

impl ParsedModule {
    /// Signature of the function at `index` in the full function index
    /// space (imports included).
    pub fn function_signature(&self, index: u32) -> Option<&FuncSignature> {
        let mut seen = 0u32;
        if index < self.num_imported_functions {
            for import in &self.imports {
                if let ImportKind::Function(type_idx) = import.kind {
                    if seen == index {
                        return self.types.get(type_idx as usize);
                    }
                    seen += 1;
                }
            }
            return None;
        }
        let local = (index - self.num_imported_functions) as usize;
        self.functions
            .get(local)
            .and_then(|f| self.types.get(f.type_idx as usize))
    }

    /// Global types in index-space order: imported globals, then local.
    pub fn global_types(&self) -> Vec<ValType> {
        let mut types = Vec::new();
        for import in &self.imports {
            if let ImportKind::Global { val_type, .. } = import.kind {
                types.push(val_type);
            }
        }
        types.extend(self.globals.iter().map(|g| g.val_type));
        types
    }

    /// Export entry for the function at `index`, if any.
    pub fn function_export(&self, index: u32) -> Option<&ExportInfo> {
        self.exports
            .iter()
            .find(|e| e.kind == ExportKind::Func && e.index == index)
    }
}

/// Evaluate a constant initialiser expression to a table offset.
fn eval_offset_expr(const_expr: wasmparser::ConstExpr) -> Result<u32> {
    let mut reader = const_expr.get_operators_reader();
    let op = reader.read().context("reading const expr operator")?;
    match op {
        wasmparser::Operator::I32Const { value } => Ok(value as u32),
        other => anyhow::bail!("unsupported const expression operator: {:?}", other),
    }
}

/// Parse an active element segment; passive and declared segments have no
/// place in the static table model and are skipped.
fn parse_element_segment(element: wasmparser::Element) -> Result<Option<ElementSegment>> {
    match element.kind {
        wasmparser::ElementKind::Active {
            table_index,
            offset_expr,
        } => {
            let tidx = table_index.unwrap_or(0);
            if tidx != 0 {
                anyhow::bail!("multi-table element segments not supported ({})", tidx);
            }
            let offset = eval_offset_expr(offset_expr)?;
            let mut func_indices = Vec::new();
            match element.items {
                wasmparser::ElementItems::Functions(funcs) => {
                    for func_idx in funcs {
                        func_indices.push(func_idx.context("reading element func index")?);
                    }
                }
                wasmparser::ElementItems::Expressions(..) => {
                    anyhow::bail!("expression-based element segments not supported");
                }
            }
            Ok(Some(ElementSegment {
                offset,
                func_indices,
            }))
        }
        wasmparser::ElementKind::Passive | wasmparser::ElementKind::Declared => Ok(None),
    }
}

/// Parse one code section entry: locals expanded, body kept as bytes.
fn parse_code_entry(body: wasmparser::FunctionBody, type_idx: u32) -> Result<ParsedFunction> {
    let mut locals = Vec::new();
    let locals_reader = body.get_locals_reader().context("getting locals reader")?;
    for local in locals_reader {
        let (count, val_type) = local.context("reading local")?;
        let ty = ValType::from_wasmparser(val_type)?;
        for _ in 0..count {
            locals.push(ty);
        }
    }

    let operators_reader = body
        .get_operators_reader()
        .context("getting operators reader")?;
    let mut binary_reader = operators_reader.get_binary_reader();
    let remaining = binary_reader.bytes_remaining();
    let body_bytes = binary_reader
        .read_bytes(remaining)
        .context("reading body bytes")?;

    Ok(ParsedFunction {
        type_idx,
        locals,
        body: body_bytes.to_vec(),
    })
}

/// Decode a function body into its operator sequence.
pub fn parse_function_operators(body: &[u8]) -> Result<Vec<wasmparser::Operator<'_>>> {
    let mut operators = Vec::new();
    let mut binary_reader = wasmparser::BinaryReader::new(body, 0);
    while !binary_reader.eof() {
        let op = binary_reader
            .read_operator()
            .context("failed to read operator")?;
        operators.push(op);
    }
    Ok(operators)
}

/// Parse a WebAssembly binary into a structured module.
pub fn parse_wasm(wasm_bytes: &[u8]) -> Result<ParsedModule> {
    let parser = Parser::new(0);

    let mut module = ParsedModule::default();
    let mut function_types: Vec<u32> = Vec::new();

    for payload in parser.parse_all(wasm_bytes) {
        let payload = payload.context("parsing wasm payload")?;
        match payload {
            Payload::TypeSection(reader) => {
                for rec_group in reader {
                    let rec_group = rec_group.context("reading rec group")?;
                    for sub_type in rec_group.types() {
                        match &sub_type.composite_type.inner {
                            wasmparser::CompositeInnerType::Func(func_ty) => {
                                let params = func_ty
                                    .params()
                                    .iter()
                                    .map(|t| ValType::from_wasmparser(*t))
                                    .collect::<Result<Vec<_>>>()?;
                                let results = func_ty
                                    .results()
                                    .iter()
                                    .map(|t| ValType::from_wasmparser(*t))
                                    .collect::<Result<Vec<_>>>()?;
                                module.types.push(FuncSignature { params, results });
                            }
                            // GC proposal types play no role here.
                            _ => {}
                        }
                    }
                }
            }

            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.context("reading import")?;
                    let kind = match import.ty {
                        TypeRef::Func(type_idx) => {
                            module.num_imported_functions += 1;
                            ImportKind::Function(type_idx)
                        }
                        TypeRef::Global(global_ty) => {
                            module.num_imported_globals += 1;
                            ImportKind::Global {
                                val_type: ValType::from_wasmparser(global_ty.content_type)?,
                                mutable: global_ty.mutable,
                            }
                        }
                        TypeRef::Memory(_) => ImportKind::Memory,
                        TypeRef::Table(_) => ImportKind::Table,
                        _ => continue,
                    };
                    module.imports.push(ImportInfo {
                        module_name: import.module.to_string(),
                        name: import.name.to_string(),
                        kind,
                    });
                }
            }

            Payload::FunctionSection(reader) => {
                for func_type_idx in reader {
                    function_types
                        .push(func_type_idx.context("reading function type index")?);
                }
            }

            Payload::CodeSectionEntry(body) => {
                let type_idx = function_types[module.functions.len()];
                let parsed = parse_code_entry(body, type_idx)?;
                module.functions.push(parsed);
            }

            Payload::MemorySection(reader) => {
                if let Some(mem) = reader.into_iter().next() {
                    let memory_type = mem.context("reading memory type")?;
                    module.memory = Some(MemoryInfo {
                        initial_pages: memory_type.initial as u32,
                        maximum_pages: memory_type.maximum.map(|m| m as u32),
                    });
                }
            }

            Payload::TableSection(reader) => {
                if let Some(tbl) = reader.into_iter().next() {
                    let tbl = tbl.context("reading table type")?;
                    module.table = Some(TableInfo {
                        initial_size: tbl.ty.initial as u32,
                        max_size: tbl.ty.maximum.map(|m| m as u32),
                    });
                }
            }

            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element.context("reading element segment")?;
                    if let Some(segment) = parse_element_segment(element)? {
                        module.element_segments.push(segment);
                    }
                }
            }

            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.context("reading global")?;
                    module.globals.push(GlobalInfo {
                        val_type: ValType::from_wasmparser(global.ty.content_type)?,
                        mutable: global.ty.mutable,
                    });
                }
            }

            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.context("reading export")?;
                    let kind = match export.kind {
                        ExternalKind::Func => ExportKind::Func,
                        ExternalKind::Table => ExportKind::Table,
                        ExternalKind::Memory => ExportKind::Memory,
                        ExternalKind::Global => ExportKind::Global,
                        _ => continue,
                    };
                    module.exports.push(ExportInfo {
                        name: export.name.to_string(),
                        kind,
                        index: export.index,
                    });
                }
            }

            _ => {}
        }
    }

    Ok(module)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
