//! Text-based LLVM IR Generation
//!
//! Generates LLVM IR as text (.ll files) that external `opt`/`llc`
//! compile to native objects. No LLVM C API dependency, which keeps the
//! backend portable and the output diffable for the bootstrap
//! fixed-point check; everything here must be deterministic.
//!
//! Contracts the emitter honors:
//! - `%BmbString = type { ptr, i64, i64 }` is defined at module top and
//!   every string value travels as a pointer to it
//! - field access is a typed `getelementptr`, never byte arithmetic on
//!   an opaque pointer
//! - when phi operands disagree, pointer type beats integer type
//! - the runtime call table below is authoritative for return and
//!   parameter types at every call site

use std::collections::HashMap;
use std::fmt::Write;

use crate::error::CompileError;
use crate::mir::{
    BasicBlock, Constant, MirBinOp, MirFunction, MirInst, MirProgram, MirType, MirUnOp, Operand,
    Place, Terminator,
};

type CgResult<T> = Result<T, CompileError>;

/// Text-based LLVM IR Generator
pub struct TextCodeGen {
    target_triple: String,
}

impl Default for TextCodeGen {
    fn default() -> Self {
        Self::new()
    }
}

impl TextCodeGen {
    pub fn new() -> Self {
        Self {
            target_triple: Self::default_target_triple(),
        }
    }

    /// Create with custom target triple
    pub fn with_target(target: impl Into<String>) -> Self {
        Self {
            target_triple: target.into(),
        }
    }

    fn default_target_triple() -> String {
        #[cfg(target_os = "windows")]
        {
            "x86_64-pc-windows-gnu".to_string()
        }
        #[cfg(target_os = "linux")]
        {
            "x86_64-unknown-linux-gnu".to_string()
        }
        #[cfg(target_os = "macos")]
        {
            "x86_64-apple-darwin".to_string()
        }
        #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
        {
            "x86_64-unknown-linux-gnu".to_string()
        }
    }

    /// Generate the complete LLVM IR module as text
    pub fn generate(&self, program: &MirProgram) -> CgResult<String> {
        let mut out = String::new();

        writeln!(out, "; ModuleID = 'bmb_program'").ok();
        writeln!(out, "target triple = \"{}\"", self.target_triple).ok();
        writeln!(out).ok();

        // The string record type heads every module, even string-free
        // ones: runtime declarations reference it.
        writeln!(out, "%BmbString = type {{ ptr, i64, i64 }}").ok();
        writeln!(out).ok();

        self.emit_struct_types(&mut out, program);
        self.emit_enum_types(&mut out, program);

        let string_table = collect_string_constants(program);
        self.emit_string_globals(&mut out, &string_table);

        self.emit_runtime_declarations(&mut out);

        // User function signature table for call-site typing.
        let fn_sigs: HashMap<String, (String, Vec<String>)> = program
            .functions
            .iter()
            .map(|f| {
                (
                    f.name.clone(),
                    (
                        llvm_type(&f.ret_ty).to_string(),
                        f.params.iter().map(|(_, t)| llvm_type(t).to_string()).collect(),
                    ),
                )
            })
            .collect();

        for func in &program.functions {
            self.emit_function(&mut out, func, program, &string_table, &fn_sigs)?;
        }

        Ok(out)
    }

    /// Struct records, sorted by name for deterministic output.
    fn emit_struct_types(&self, out: &mut String, program: &MirProgram) {
        if program.struct_defs.is_empty() {
            return;
        }
        writeln!(out, "; Struct type definitions").ok();
        let mut sorted: Vec<_> = program.struct_defs.iter().collect();
        sorted.sort_by_key(|(name, _)| name.as_str());
        for (name, fields) in sorted {
            let field_types: Vec<&str> = fields.iter().map(|(_, ty)| llvm_type(ty)).collect();
            writeln!(out, "%struct.{} = type {{ {} }}", name, field_types.join(", ")).ok();
        }
        writeln!(out).ok();
    }

    /// Enum records: a tag word plus payload slots, all i64.
    fn emit_enum_types(&self, out: &mut String, program: &MirProgram) {
        if program.enum_defs.is_empty() {
            return;
        }
        writeln!(out, "; Enum type definitions").ok();
        let mut sorted: Vec<_> = program.enum_defs.iter().collect();
        sorted.sort_by_key(|(name, _)| name.as_str());
        for (name, variants) in sorted {
            let payload = variants.iter().map(|(_, tys)| tys.len()).max().unwrap_or(0);
            writeln!(out, "%enum.{name} = type {{ i64, [{payload} x i64] }}").ok();
        }
        writeln!(out).ok();
    }

    /// String constants, plus pre-initialized BmbString records so a
    /// literal costs no allocation at runtime.
    fn emit_string_globals(&self, out: &mut String, table: &StringTable) {
        if table.entries.is_empty() {
            return;
        }
        writeln!(out, "; String constants").ok();
        for (content, name) in &table.entries {
            let escaped = escape_string_for_llvm(content);
            let byte_len = content.len() + 1;
            let str_len = content.len() as i64;
            writeln!(
                out,
                "@{name} = private unnamed_addr constant [{byte_len} x i8] c\"{escaped}\\00\""
            )
            .ok();
            writeln!(
                out,
                "@{name}.bmb = private unnamed_addr global %BmbString {{ ptr @{name}, i64 {str_len}, i64 {str_len} }}"
            )
            .ok();
        }
        writeln!(out).ok();
    }

    fn emit_runtime_declarations(&self, out: &mut String) {
        writeln!(out, "; Runtime declarations").ok();
        let mut rows: Vec<&(&str, &str, &[&str])> = RUNTIME_ABI.iter().collect();
        rows.sort_by_key(|(name, _, _)| *name);
        for &(name, ret, params) in rows {
            let params = params.join(", ");
            let attrs = match name {
                "malloc" => " nounwind allocsize(0)",
                "bmb_string_len" | "bmb_string_byte_at" | "bmb_string_eq" | "bmb_ord" => {
                    " nounwind willreturn"
                }
                _ => " nounwind",
            };
            writeln!(out, "declare {ret} @{name}({params}){attrs}").ok();
        }
        writeln!(out).ok();
    }

    fn emit_function(
        &self,
        out: &mut String,
        func: &MirFunction,
        program: &MirProgram,
        strings: &StringTable,
        fn_sigs: &HashMap<String, (String, Vec<String>)>,
    ) -> CgResult<()> {
        // The user's entry point becomes bmb_user_main; the runtime owns
        // the real main(argc, argv).
        let symbol = rename_main(&func.name);

        let ret = llvm_type(&func.ret_ty);
        let params: Vec<String> = func
            .params
            .iter()
            .map(|(name, ty)| {
                let lty = llvm_type(ty);
                match ty {
                    // Freshly heap-allocated records are unique and
                    // never null.
                    MirType::Struct(_) | MirType::Enum(_) => {
                        format!("{lty} noalias nonnull %{name}")
                    }
                    MirType::String => format!("{lty} nonnull %{name}"),
                    _ => format!("{lty} %{name}"),
                }
            })
            .collect();

        let linkage = if func.is_public || symbol == "bmb_user_main" {
            ""
        } else {
            "internal "
        };
        let mut attrs = String::new();
        if func.is_pure {
            attrs.push_str(" readonly nounwind");
        }
        if func.inline_hint {
            attrs.push_str(" inlinehint");
        }

        writeln!(
            out,
            "define {linkage}{ret} @{symbol}({}){attrs} {{",
            params.join(", ")
        )
        .ok();

        let mut cg = FunctionCg {
            func,
            program,
            strings,
            fn_sigs,
            out,
            temp: 0,
        };
        for block in &func.blocks {
            cg.emit_block(block)?;
        }

        writeln!(out, "}}").ok();
        writeln!(out).ok();
        Ok(())
    }
}

/// Per-function emission state.
struct FunctionCg<'a> {
    func: &'a MirFunction,
    program: &'a MirProgram,
    strings: &'a StringTable,
    fn_sigs: &'a HashMap<String, (String, Vec<String>)>,
    out: &'a mut String,
    /// Counter for emitter-internal temporaries (GEPs, converts)
    temp: usize,
}

impl<'a> FunctionCg<'a> {
    fn fresh(&mut self) -> String {
        let name = format!("%cg{}", self.temp);
        self.temp += 1;
        name
    }

    fn place_type(&self, place: &Place) -> CgResult<&MirType> {
        self.func.type_of(&place.name).ok_or_else(|| {
            CompileError::codegen(format!(
                "type not in local map: %{} (in `{}`)",
                place.name, self.func.name
            ))
        })
    }

    fn operand_llvm_type(&self, op: &Operand) -> CgResult<&'static str> {
        Ok(match op {
            Operand::Constant(c) => match c {
                Constant::Int(_) => "i64",
                Constant::Float(_) => "double",
                Constant::Bool(_) => "i1",
                Constant::String(_) | Constant::Func(_) | Constant::Null => "ptr",
                Constant::Unit => "i64",
            },
            Operand::Place(p) => llvm_type(self.place_type(p)?),
        })
    }

    /// Render an operand inline (no instruction emitted).
    fn render(&self, op: &Operand) -> CgResult<String> {
        Ok(match op {
            Operand::Place(p) => format!("%{}", p.name),
            Operand::Constant(c) => match c {
                Constant::Int(n) => n.to_string(),
                Constant::Float(x) => format_double(*x),
                Constant::Bool(b) => if *b { "true" } else { "false" }.to_string(),
                Constant::String(s) => {
                    let name = self.strings.lookup(s).ok_or_else(|| {
                        CompileError::codegen("string constant missing from table")
                    })?;
                    format!("@{name}.bmb")
                }
                Constant::Func(f) => format!("@{}", rename_main(f)),
                Constant::Null => "null".to_string(),
                Constant::Unit => "0".to_string(),
            },
        })
    }

    /// Render an operand, inserting a conversion when its LLVM type
    /// disagrees with `want`. This is the ptr/i64 guard rail at call
    /// and store sites.
    fn render_as(&mut self, op: &Operand, want: &str) -> CgResult<String> {
        let got = self.operand_llvm_type(op)?;
        let rendered = self.render(op)?;
        if got == want {
            return Ok(rendered);
        }
        let tmp = self.fresh();
        match (got, want) {
            ("i64", "ptr") => {
                writeln!(self.out, "  {tmp} = inttoptr i64 {rendered} to ptr").ok();
            }
            ("ptr", "i64") => {
                writeln!(self.out, "  {tmp} = ptrtoint ptr {rendered} to i64").ok();
            }
            ("i1", "i64") => {
                writeln!(self.out, "  {tmp} = zext i1 {rendered} to i64").ok();
            }
            ("i64", "i1") => {
                writeln!(self.out, "  {tmp} = icmp ne i64 {rendered}, 0").ok();
            }
            ("i32", "i64") => {
                writeln!(self.out, "  {tmp} = sext i32 {rendered} to i64").ok();
            }
            ("i64", "i32") => {
                writeln!(self.out, "  {tmp} = trunc i64 {rendered} to i32").ok();
            }
            ("i64", "double") => {
                writeln!(self.out, "  {tmp} = sitofp i64 {rendered} to double").ok();
            }
            ("double", "i64") => {
                writeln!(self.out, "  {tmp} = fptosi double {rendered} to i64").ok();
            }
            _ => {
                return Err(CompileError::codegen(format!(
                    "cannot coerce {got} to {want} at a call site in `{}`",
                    self.func.name
                )));
            }
        }
        Ok(tmp)
    }

    fn emit_block(&mut self, block: &BasicBlock) -> CgResult<()> {
        // The entry block gets an explicit label too; branch targets
        // stay stable that way.
        writeln!(self.out, "{}:", block.label).ok();
        for inst in &block.instructions {
            self.emit_inst(inst)?;
        }
        self.emit_terminator(&block.terminator)?;
        Ok(())
    }

    fn emit_inst(&mut self, inst: &MirInst) -> CgResult<()> {
        match inst {
            MirInst::Const { dest, value } => {
                let ty = llvm_type(self.place_type(dest)?);
                let rendered = self.render(&Operand::Constant(value.clone()))?;
                match ty {
                    "ptr" => {
                        writeln!(
                            self.out,
                            "  %{} = getelementptr i8, ptr {rendered}, i64 0",
                            dest.name
                        )
                        .ok();
                    }
                    "double" => {
                        writeln!(self.out, "  %{} = fadd double {rendered}, 0.0", dest.name).ok();
                    }
                    "i1" => {
                        writeln!(self.out, "  %{} = or i1 {rendered}, false", dest.name).ok();
                    }
                    _ => {
                        writeln!(self.out, "  %{} = add {ty} {rendered}, 0", dest.name).ok();
                    }
                }
            }

            MirInst::Copy { dest, src } => {
                let ty = llvm_type(self.place_type(dest)?);
                if ty == "ptr" {
                    writeln!(
                        self.out,
                        "  %{} = getelementptr i8, ptr %{}, i64 0",
                        dest.name, src.name
                    )
                    .ok();
                } else if ty == "double" {
                    writeln!(self.out, "  %{} = fadd double %{}, 0.0", dest.name, src.name).ok();
                } else {
                    writeln!(self.out, "  %{} = add {ty} %{}, 0", dest.name, src.name).ok();
                }
            }

            MirInst::BinOp { dest, op, lhs, rhs } => {
                self.emit_binop(dest, *op, lhs, rhs)?;
            }

            MirInst::UnOp { dest, op, src } => {
                let rendered = self.render(src)?;
                let ty = self.operand_llvm_type(src)?;
                match op {
                    MirUnOp::Neg => {
                        writeln!(self.out, "  %{} = sub nsw {ty} 0, {rendered}", dest.name).ok();
                    }
                    MirUnOp::FNeg => {
                        writeln!(self.out, "  %{} = fneg double {rendered}", dest.name).ok();
                    }
                    MirUnOp::Not => {
                        writeln!(self.out, "  %{} = xor i1 {rendered}, true", dest.name).ok();
                    }
                    MirUnOp::Bnot => {
                        writeln!(self.out, "  %{} = xor {ty} {rendered}, -1", dest.name).ok();
                    }
                }
            }

            MirInst::Call {
                dest,
                func,
                args,
                ret_ty,
                indirect,
            } => {
                let (ret, param_tys) = if *indirect {
                    // Indirect calls trust the MIR tag; args pass at
                    // their natural types.
                    let tys: CgResult<Vec<String>> = args
                        .iter()
                        .map(|a| self.operand_llvm_type(a).map(String::from))
                        .collect();
                    (llvm_type(ret_ty).to_string(), tys?)
                } else {
                    match self.fn_sigs.get(func) {
                        Some((ret, params)) => (ret.clone(), params.clone()),
                        None => {
                            return Err(CompileError::codegen(format!(
                                "call to unknown function `@{func}`"
                            )));
                        }
                    }
                };
                let mut rendered_args = Vec::with_capacity(args.len());
                for (arg, want) in args.iter().zip(&param_tys) {
                    let r = self.render_as(arg, want)?;
                    rendered_args.push(format!("{want} {r}"));
                }
                let callee = if *indirect {
                    format!("%{func}")
                } else {
                    format!("@{}", rename_main(func))
                };
                let args_str = rendered_args.join(", ");
                match (dest, ret.as_str()) {
                    (_, "void") => {
                        writeln!(self.out, "  call void {callee}({args_str})").ok();
                    }
                    (Some(d), _) => {
                        writeln!(self.out, "  %{} = call {ret} {callee}({args_str})", d.name).ok();
                    }
                    (None, _) => {
                        writeln!(self.out, "  call {ret} {callee}({args_str})").ok();
                    }
                }
            }

            MirInst::RuntimeCall {
                dest,
                func,
                args,
                ret_ty: _,
            } => {
                // The authoritative table is consulted at every call
                // site; a wrong entry here is the classic SIGSEGV.
                let (ret, params) = runtime_abi(func).ok_or_else(|| {
                    CompileError::codegen(format!("unknown runtime primitive `@{func}`"))
                })?;
                let mut rendered_args = Vec::with_capacity(args.len());
                for (arg, want) in args.iter().zip(params) {
                    let r = self.render_as(arg, want)?;
                    rendered_args.push(format!("{want} {r}"));
                }
                let args_str = rendered_args.join(", ");
                if func == "malloc" {
                    // malloc returns ptr; the surface carries allocations
                    // as i64 for pointer arithmetic.
                    let raw = self.fresh();
                    writeln!(self.out, "  {raw} = call ptr @malloc({args_str})").ok();
                    if let Some(d) = dest {
                        match llvm_type(self.place_type(d)?) {
                            "ptr" => {
                                writeln!(
                                    self.out,
                                    "  %{} = getelementptr i8, ptr {raw}, i64 0",
                                    d.name
                                )
                                .ok();
                            }
                            _ => {
                                writeln!(self.out, "  %{} = ptrtoint ptr {raw} to i64", d.name)
                                    .ok();
                            }
                        }
                    }
                    return Ok(());
                }
                match (dest, ret) {
                    (_, "void") => {
                        writeln!(self.out, "  call void @{func}({args_str})").ok();
                    }
                    (Some(d), _) => {
                        writeln!(self.out, "  %{} = call {ret} @{func}({args_str})", d.name).ok();
                    }
                    (None, _) => {
                        writeln!(self.out, "  call {ret} @{func}({args_str})").ok();
                    }
                }
            }

            MirInst::FieldLoad {
                dest,
                base,
                struct_name,
                field_index,
                field_ty,
            } => {
                let gep = self.fresh();
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds %struct.{struct_name}, ptr %{}, i32 0, i32 {field_index}",
                    base.name
                )
                .ok();
                let ty = llvm_type(field_ty);
                writeln!(self.out, "  %{} = load {ty}, ptr {gep}", dest.name).ok();
            }

            MirInst::FieldStore {
                base,
                struct_name,
                field_index,
                field_ty,
                value,
            } => {
                let gep = self.fresh();
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds %struct.{struct_name}, ptr %{}, i32 0, i32 {field_index}",
                    base.name
                )
                .ok();
                let ty = llvm_type(field_ty);
                let rendered = self.render_as(value, ty)?;
                writeln!(self.out, "  store {ty} {rendered}, ptr {gep}").ok();
            }

            MirInst::IndexLoad {
                dest,
                array,
                index,
                elem_ty,
            } => {
                let gep = self.emit_index_gep(array, index, elem_ty)?;
                let ty = llvm_type(elem_ty);
                writeln!(self.out, "  %{} = load {ty}, ptr {gep}", dest.name).ok();
            }

            MirInst::IndexStore {
                array,
                index,
                value,
                elem_ty,
            } => {
                let gep = self.emit_index_gep(array, index, elem_ty)?;
                let ty = llvm_type(elem_ty);
                let rendered = self.render_as(value, ty)?;
                writeln!(self.out, "  store {ty} {rendered}, ptr {gep}").ok();
            }

            MirInst::Alloca { dest, ty, count } => {
                if *count == 1 {
                    writeln!(self.out, "  %{} = alloca {}", dest.name, llvm_type(ty)).ok();
                } else {
                    writeln!(
                        self.out,
                        "  %{} = alloca [{} x {}]",
                        dest.name,
                        count,
                        llvm_type(ty)
                    )
                    .ok();
                }
            }

            MirInst::MallocWrap { dest, size } => {
                let rendered = self.render_as(size, "i64")?;
                writeln!(self.out, "  %{} = call ptr @malloc(i64 {rendered})", dest.name).ok();
            }

            MirInst::StructInit {
                dest,
                struct_name,
                fields,
            } => {
                let def = self.program.struct_defs.get(struct_name).ok_or_else(|| {
                    CompileError::codegen(format!("unknown struct `{struct_name}` at codegen"))
                })?;
                let size = (def.len().max(1)) * 8;
                writeln!(
                    self.out,
                    "  %{} = call ptr @malloc(i64 {size})",
                    dest.name
                )
                .ok();
                for (i, (value, (_, fty))) in fields.iter().zip(def).enumerate() {
                    let gep = self.fresh();
                    writeln!(
                        self.out,
                        "  {gep} = getelementptr inbounds %struct.{struct_name}, ptr %{}, i32 0, i32 {i}",
                        dest.name
                    )
                    .ok();
                    let ty = llvm_type(fty);
                    let rendered = self.render_as(value, ty)?;
                    writeln!(self.out, "  store {ty} {rendered}, ptr {gep}").ok();
                }
            }

            MirInst::VariantInit {
                dest,
                enum_name,
                variant_index,
                args,
            } => {
                let variants = self.program.enum_defs.get(enum_name).ok_or_else(|| {
                    CompileError::codegen(format!("unknown enum `{enum_name}` at codegen"))
                })?;
                let payload = variants.iter().map(|(_, tys)| tys.len()).max().unwrap_or(0);
                let size = (1 + payload) * 8;
                writeln!(self.out, "  %{} = call ptr @malloc(i64 {size})", dest.name).ok();
                let tag_gep = self.fresh();
                writeln!(
                    self.out,
                    "  {tag_gep} = getelementptr inbounds %enum.{enum_name}, ptr %{}, i32 0, i32 0",
                    dest.name
                )
                .ok();
                writeln!(self.out, "  store i64 {variant_index}, ptr {tag_gep}").ok();
                for (i, arg) in args.iter().enumerate() {
                    let slot = self.fresh();
                    writeln!(
                        self.out,
                        "  {slot} = getelementptr inbounds %enum.{enum_name}, ptr %{}, i32 0, i32 1, i64 {i}",
                        dest.name
                    )
                    .ok();
                    // Payload slots are i64; pointers round-trip through
                    // ptrtoint/inttoptr.
                    let rendered = self.render_as(arg, "i64")?;
                    writeln!(self.out, "  store i64 {rendered}, ptr {slot}").ok();
                }
            }

            MirInst::VariantTag { dest, src } => {
                let enum_name = match self.place_type(src)? {
                    MirType::Enum(name) => name.clone(),
                    other => {
                        return Err(CompileError::codegen(format!(
                            "variant-test on non-enum value of type {other:?}"
                        )));
                    }
                };
                let gep = self.fresh();
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds %enum.{enum_name}, ptr %{}, i32 0, i32 0",
                    src.name
                )
                .ok();
                writeln!(self.out, "  %{} = load i64, ptr {gep}", dest.name).ok();
            }

            MirInst::VariantField {
                dest,
                src,
                enum_name,
                index,
                field_ty,
            } => {
                let gep = self.fresh();
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds %enum.{enum_name}, ptr %{}, i32 0, i32 1, i64 {index}",
                    src.name
                )
                .ok();
                let raw = self.fresh();
                writeln!(self.out, "  {raw} = load i64, ptr {gep}").ok();
                match llvm_type(field_ty) {
                    "i64" => {
                        writeln!(self.out, "  %{} = add i64 {raw}, 0", dest.name).ok();
                    }
                    "ptr" => {
                        writeln!(self.out, "  %{} = inttoptr i64 {raw} to ptr", dest.name).ok();
                    }
                    "double" => {
                        writeln!(self.out, "  %{} = bitcast i64 {raw} to double", dest.name).ok();
                    }
                    "i1" => {
                        writeln!(self.out, "  %{} = icmp ne i64 {raw}, 0", dest.name).ok();
                    }
                    other => {
                        writeln!(self.out, "  %{} = trunc i64 {raw} to {other}", dest.name).ok();
                    }
                }
            }

            MirInst::Phi { dest, ty, values } => {
                // Phi-type widening: when operand types disagree,
                // pointer wins over integer. inttoptr on an operand
                // would defeat alias analysis; pointers carry strictly
                // more information.
                let mut joined = llvm_type(ty);
                for (op, _) in values {
                    let operand_ty = self.operand_llvm_type(op)?;
                    joined = widen(joined, operand_ty);
                }
                // Conversions cannot be inserted at the phi itself;
                // lowering already coerced the incoming values in their
                // predecessor blocks.
                let mut incoming = Vec::with_capacity(values.len());
                for (op, label) in values {
                    let rendered = self.render(op)?;
                    incoming.push(format!("[ {rendered}, %{label} ]"));
                }
                writeln!(
                    self.out,
                    "  %{} = phi {joined} {}",
                    dest.name,
                    incoming.join(", ")
                )
                .ok();
            }

            MirInst::Cast {
                dest,
                src,
                from_ty,
                to_ty,
            } => {
                let rendered = self.render(src)?;
                let from = llvm_type(from_ty);
                let to = llvm_type(to_ty);
                let line = match (from, to) {
                    ("i64", "double") | ("i32", "double") => {
                        format!("sitofp {from} {rendered} to {to}")
                    }
                    ("double", "i64") | ("double", "i32") | ("float", "i64") => {
                        format!("fptosi {from} {rendered} to {to}")
                    }
                    ("float", "double") => format!("fpext float {rendered} to double"),
                    ("double", "float") => format!("fptrunc double {rendered} to float"),
                    ("i1", _) => format!("zext i1 {rendered} to {to}"),
                    (_, "i1") => format!("icmp ne {from} {rendered}, 0"),
                    (f, t) if int_rank(f) < int_rank(t) => format!("sext {f} {rendered} to {t}"),
                    (f, t) if int_rank(f) > int_rank(t) => format!("trunc {f} {rendered} to {t}"),
                    _ => format!("add {to} {rendered}, 0"),
                };
                writeln!(self.out, "  %{} = {line}", dest.name).ok();
            }
        }
        Ok(())
    }

    fn emit_binop(
        &mut self,
        dest: &Place,
        op: MirBinOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> CgResult<()> {
        let lhs_ty = self.operand_llvm_type(lhs)?;
        let rhs_ty = self.operand_llvm_type(rhs)?;
        // Pointer beats integer for the operand type too, so null
        // comparisons and pointer equality come out as ptr icmps.
        let ty = widen(lhs_ty, rhs_ty);
        let l = self.render_as(lhs, ty)?;
        let r = self.render_as(rhs, ty)?;

        let line = match op {
            // nsw enables the integer transforms that matter here:
            // strength reduction and induction-variable simplification.
            MirBinOp::Add => format!("add nsw {ty} {l}, {r}"),
            MirBinOp::Sub => format!("sub nsw {ty} {l}, {r}"),
            MirBinOp::Mul => format!("mul nsw {ty} {l}, {r}"),
            MirBinOp::Div => format!("sdiv {ty} {l}, {r}"),
            MirBinOp::Mod => format!("srem {ty} {l}, {r}"),
            MirBinOp::FAdd => format!("fadd double {l}, {r}"),
            MirBinOp::FSub => format!("fsub double {l}, {r}"),
            MirBinOp::FMul => format!("fmul double {l}, {r}"),
            MirBinOp::FDiv => format!("fdiv double {l}, {r}"),
            MirBinOp::Eq => format!("icmp eq {ty} {l}, {r}"),
            MirBinOp::Ne => format!("icmp ne {ty} {l}, {r}"),
            MirBinOp::Lt => format!("icmp slt {ty} {l}, {r}"),
            MirBinOp::Gt => format!("icmp sgt {ty} {l}, {r}"),
            MirBinOp::Le => format!("icmp sle {ty} {l}, {r}"),
            MirBinOp::Ge => format!("icmp sge {ty} {l}, {r}"),
            MirBinOp::FEq => format!("fcmp oeq double {l}, {r}"),
            MirBinOp::FNe => format!("fcmp une double {l}, {r}"),
            MirBinOp::FLt => format!("fcmp olt double {l}, {r}"),
            MirBinOp::FGt => format!("fcmp ogt double {l}, {r}"),
            MirBinOp::FLe => format!("fcmp ole double {l}, {r}"),
            MirBinOp::FGe => format!("fcmp oge double {l}, {r}"),
            MirBinOp::And => format!("and i1 {l}, {r}"),
            MirBinOp::Or => format!("or i1 {l}, {r}"),
            MirBinOp::Band => format!("and {ty} {l}, {r}"),
            MirBinOp::Bor => format!("or {ty} {l}, {r}"),
            MirBinOp::Bxor => format!("xor {ty} {l}, {r}"),
            MirBinOp::Shl => format!("shl {ty} {l}, {r}"),
            MirBinOp::Shr => format!("ashr {ty} {l}, {r}"),
        };
        writeln!(self.out, "  %{} = {line}", dest.name).ok();
        Ok(())
    }

    /// GEP for an index access. Fixed-size arrays go through the array
    /// type; opaque pointers index by element.
    fn emit_index_gep(
        &mut self,
        array: &Place,
        index: &Operand,
        elem_ty: &MirType,
    ) -> CgResult<String> {
        let idx = self.render_as(index, "i64")?;
        let gep = self.fresh();
        match self.place_type(array)?.clone() {
            MirType::Array { elem, size } => {
                let ety = llvm_type(&elem);
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds [{size} x {ety}], ptr %{}, i64 0, i64 {idx}",
                    array.name
                )
                .ok();
            }
            _ => {
                let ety = llvm_type(elem_ty);
                writeln!(
                    self.out,
                    "  {gep} = getelementptr inbounds {ety}, ptr %{}, i64 {idx}",
                    array.name
                )
                .ok();
            }
        }
        Ok(gep)
    }

    fn emit_terminator(&mut self, term: &Terminator) -> CgResult<()> {
        match term {
            Terminator::Return(None) => {
                if matches!(self.func.ret_ty, MirType::Unit) {
                    writeln!(self.out, "  ret void").ok();
                } else {
                    let ty = llvm_type(&self.func.ret_ty);
                    writeln!(self.out, "  ret {ty} {}", zero_of(ty)).ok();
                }
            }
            Terminator::Return(Some(op)) => {
                if matches!(self.func.ret_ty, MirType::Unit) {
                    writeln!(self.out, "  ret void").ok();
                } else {
                    let ty = llvm_type(&self.func.ret_ty);
                    let rendered = self.render_as(op, ty)?;
                    writeln!(self.out, "  ret {ty} {rendered}").ok();
                }
            }
            Terminator::Goto(label) => {
                writeln!(self.out, "  br label %{label}").ok();
            }
            Terminator::Branch {
                cond,
                then_label,
                else_label,
            } => {
                let rendered = self.render_as(cond, "i1")?;
                writeln!(
                    self.out,
                    "  br i1 {rendered}, label %{then_label}, label %{else_label}"
                )
                .ok();
            }
            Terminator::Switch {
                discriminant,
                cases,
                default,
            } => {
                let rendered = self.render_as(discriminant, "i64")?;
                let mut line = format!("  switch i64 {rendered}, label %{default} [");
                for (value, label) in cases {
                    line.push_str(&format!(" i64 {value}, label %{label}"));
                }
                line.push_str(" ]");
                writeln!(self.out, "{line}").ok();
            }
            Terminator::Unreachable => {
                writeln!(self.out, "  unreachable").ok();
            }
        }
        Ok(())
    }
}

/// Rename the user entry point; everything else keeps its name.
fn rename_main(name: &str) -> String {
    if name == "main" {
        "bmb_user_main".to_string()
    } else {
        name.to_string()
    }
}

fn llvm_type(ty: &MirType) -> &'static str {
    match ty {
        MirType::I8 => "i8",
        MirType::I16 => "i16",
        MirType::I32 => "i32",
        MirType::I64 => "i64",
        MirType::F32 => "float",
        MirType::F64 => "double",
        MirType::Bool => "i1",
        MirType::Unit => "void",
        MirType::String
        | MirType::Ptr
        | MirType::Struct(_)
        | MirType::Enum(_)
        | MirType::Array { .. } => "ptr",
    }
}

/// Join two LLVM types for phi and binop operands: ptr beats numbers,
/// double beats integers, wider integers beat narrower ones.
fn widen(a: &'static str, b: &'static str) -> &'static str {
    match (a, b) {
        _ if a == b => a,
        ("ptr", _) | (_, "ptr") => "ptr",
        ("double", _) | (_, "double") => "double",
        _ if int_rank(a) >= int_rank(b) => a,
        _ => b,
    }
}

fn int_rank(ty: &str) -> u8 {
    match ty {
        "i1" => 1,
        "i8" => 8,
        "i16" => 16,
        "i32" => 32,
        "i64" => 64,
        _ => 0,
    }
}

fn zero_of(ty: &str) -> &'static str {
    match ty {
        "double" | "float" => "0.0",
        "ptr" => "null",
        "i1" => "false",
        _ => "0",
    }
}

/// Render a double so the textual IR round-trips exactly: LLVM accepts
/// the raw 64-bit pattern in hex.
fn format_double(x: f64) -> String {
    format!("0x{:016X}", x.to_bits())
}

/// Escape a string for an LLVM byte-array constant.
fn escape_string_for_llvm(s: &str) -> String {
    let mut result = String::new();
    for c in s.bytes() {
        match c {
            0x20..=0x21 | 0x23..=0x5B | 0x5D..=0x7E => result.push(c as char),
            _ => result.push_str(&format!("\\{c:02X}")),
        }
    }
    result
}

/// Interned string constants in first-seen order, which is program
/// order and therefore deterministic across runs.
struct StringTable {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl StringTable {
    fn lookup(&self, content: &str) -> Option<&str> {
        self.index
            .get(content)
            .map(|&i| self.entries[i].1.as_str())
    }
}

fn add_string(table: &mut StringTable, s: &str) {
    if !table.index.contains_key(s) {
        let name = format!(".str.{}", table.entries.len());
        table.index.insert(s.to_string(), table.entries.len());
        table.entries.push((s.to_string(), name));
    }
}

fn visit_string_op(table: &mut StringTable, op: &Operand) {
    if let Operand::Constant(Constant::String(s)) = op {
        add_string(table, s);
    }
}

fn collect_string_constants(program: &MirProgram) -> StringTable {
    let mut table = StringTable {
        entries: Vec::new(),
        index: HashMap::new(),
    };
    for func in &program.functions {
        for block in &func.blocks {
            for inst in &block.instructions {
                match inst {
                    MirInst::Const {
                        value: Constant::String(s),
                        ..
                    } => add_string(&mut table, s),
                    MirInst::BinOp { lhs, rhs, .. } => {
                        visit_string_op(&mut table, lhs);
                        visit_string_op(&mut table, rhs);
                    }
                    MirInst::UnOp { src, .. } => visit_string_op(&mut table, src),
                    MirInst::Call { args, .. } | MirInst::RuntimeCall { args, .. } => {
                        for a in args {
                            visit_string_op(&mut table, a);
                        }
                    }
                    MirInst::Phi { values, .. } => {
                        for (v, _) in values {
                            visit_string_op(&mut table, v);
                        }
                    }
                    MirInst::StructInit { fields, .. } => {
                        for f in fields {
                            visit_string_op(&mut table, f);
                        }
                    }
                    MirInst::VariantInit { args, .. } => {
                        for a in args {
                            visit_string_op(&mut table, a);
                        }
                    }
                    MirInst::FieldStore { value, .. } => visit_string_op(&mut table, value),
                    MirInst::IndexStore { value, index, .. } => {
                        visit_string_op(&mut table, value);
                        visit_string_op(&mut table, index);
                    }
                    MirInst::IndexLoad { index, .. } => visit_string_op(&mut table, index),
                    MirInst::MallocWrap { size, .. } => visit_string_op(&mut table, size),
                    MirInst::Cast { src, .. } => visit_string_op(&mut table, src),
                    _ => {}
                }
            }
            match &block.terminator {
                Terminator::Return(Some(op)) => visit_string_op(&mut table, op),
                Terminator::Branch { cond, .. } => visit_string_op(&mut table, cond),
                Terminator::Switch { discriminant, .. } => {
                    visit_string_op(&mut table, discriminant)
                }
                _ => {}
            }
        }
    }
    table
}

/// The authoritative runtime ABI: symbol -> (return type, param types).
///
/// Every RuntimeCall consults this at emission; `infer_call_return_type`
/// answers from the same rows.
const RUNTIME_ABI: &[(&str, &str, &[&str])] = &[
    // Numeric output
    ("bmb_println_i64", "void", &["i64"]),
    ("bmb_print_i64", "void", &["i64"]),
    ("bmb_println_f64", "void", &["double"]),
    ("bmb_print_f64", "void", &["double"]),
    ("bmb_println_str", "void", &["ptr"]),
    ("bmb_print_str", "void", &["ptr"]),
    ("bmb_read_int", "i64", &[]),
    ("bmb_assert", "void", &["i64"]),
    // Math
    ("bmb_abs", "i64", &["i64"]),
    ("bmb_min", "i64", &["i64", "i64"]),
    ("bmb_max", "i64", &["i64", "i64"]),
    ("bmb_sqrt", "double", &["double"]),
    ("bmb_i64_to_f64", "double", &["i64"]),
    ("bmb_f64_to_i64", "i64", &["double"]),
    // Strings: takers take ptr-to-record, producers return it
    ("bmb_string_len", "i64", &["ptr"]),
    ("bmb_string_byte_at", "i64", &["ptr", "i64"]),
    ("bmb_string_slice", "ptr", &["ptr", "i64", "i64"]),
    ("bmb_string_concat", "ptr", &["ptr", "ptr"]),
    ("bmb_string_eq", "i64", &["ptr", "ptr"]),
    ("bmb_chr", "ptr", &["i64"]),
    ("bmb_ord", "i64", &["ptr"]),
    ("bmb_digit_char", "ptr", &["i64"]),
    ("bmb_int_to_string", "ptr", &["i64"]),
    // StringBuilder: opaque i64 handles
    ("bmb_sb_new", "i64", &[]),
    ("bmb_sb_push", "i64", &["i64", "ptr"]),
    ("bmb_sb_push_char", "i64", &["i64", "i64"]),
    ("bmb_sb_push_int", "i64", &["i64", "i64"]),
    ("bmb_sb_push_escaped", "i64", &["i64", "ptr"]),
    ("bmb_sb_len", "i64", &["i64"]),
    ("bmb_sb_build", "ptr", &["i64"]),
    ("bmb_sb_clear", "i64", &["i64"]),
    // File I/O
    ("bmb_read_file", "ptr", &["ptr"]),
    ("bmb_write_file", "i64", &["ptr", "ptr"]),
    ("bmb_append_file", "i64", &["ptr", "ptr"]),
    ("bmb_file_exists", "i64", &["ptr"]),
    ("bmb_file_size", "i64", &["ptr"]),
    // Process
    ("bmb_system", "i64", &["ptr"]),
    ("bmb_getenv", "ptr", &["ptr"]),
    ("bmb_exec", "ptr", &["ptr"]),
    // CLI arguments
    ("bmb_arg_count", "i64", &[]),
    ("bmb_get_arg", "ptr", &["i64"]),
    // Vector
    ("vec_new", "i64", &[]),
    ("vec_with_capacity", "i64", &["i64"]),
    ("vec_push", "void", &["i64", "i64"]),
    ("vec_pop", "i64", &["i64"]),
    ("vec_get", "i64", &["i64", "i64"]),
    ("vec_set", "void", &["i64", "i64", "i64"]),
    ("vec_len", "i64", &["i64"]),
    ("vec_cap", "i64", &["i64"]),
    ("vec_clear", "void", &["i64"]),
    ("vec_free", "i64", &["i64"]),
    // HashMap: INT64_MIN sentinel on miss
    ("hashmap_new", "i64", &[]),
    ("hashmap_free", "i64", &["i64"]),
    ("hashmap_len", "i64", &["i64"]),
    ("hashmap_insert", "i64", &["i64", "i64", "i64"]),
    ("hashmap_get", "i64", &["i64", "i64"]),
    ("hashmap_remove", "i64", &["i64", "i64"]),
    // Memory
    ("malloc", "ptr", &["i64"]),
    ("free", "void", &["ptr"]),
    ("bmb_free", "i64", &["i64"]),
];

fn runtime_abi(name: &str) -> Option<(&'static str, &'static [&'static str])> {
    RUNTIME_ABI
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, ret, params)| (*ret, *params))
}

/// Authoritative return-type lookup for runtime calls.
pub fn infer_call_return_type(name: &str) -> Option<&'static str> {
    runtime_abi(name).map(|(ret, _)| ret)
}
