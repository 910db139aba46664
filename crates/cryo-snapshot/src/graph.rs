//! Identity-preserving flatten/rebuild of the closure object graph.
//!
//! A live continuation is a cyclic graph of `Arc`-shared nodes: globals
//! tables holding closures, sibling closures sharing upvalue cells, frames
//! whose registers hold the closures running them. The flattener interns
//! every prototype, table, cell, and closure by pointer identity into index
//! records, so the byte form is a plain DAG and every shared node is shared
//! again after rebuild. Rebuilding is two-phase — allocate shells first,
//! fill contents second — which is what makes self-referential tables and
//! recursive closures round-trip.

use crate::{HostRegistry, SnapshotError};
use cryo_core::stack::OpenUpvalue;
use cryo_core::{
    ExecutionStack, Frame, HashKey, LuaClosure, LuaTable, LuaValue, Proto, Upvalue, UpvalueDesc,
    UpvalueInner, Varargs,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ── Record types (the serialized shape) ───────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotGraph {
    pub protos: Vec<ProtoRecord>,
    pub tables: Vec<TableRecord>,
    pub cells: Vec<CellRecord>,
    pub closures: Vec<ClosureRecord>,
    pub stack: StackRecord,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProtoRecord {
    code: Vec<u32>,
    k: Vec<ValueRecord>,
    p: Vec<u32>,
    upvalues: Vec<(String, bool, u8)>,
    num_params: u8,
    is_vararg: bool,
    max_stack_size: u8,
    source: String,
    line_info: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TableRecord {
    array: Vec<ValueRecord>,
    hash: Vec<(KeyRecord, ValueRecord)>,
    metatable: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum CellRecord {
    Open { level: usize, slot: u8 },
    Closed(ValueRecord),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ClosureRecord {
    proto: u32,
    env: ValueRecord,
    upvalues: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FrameRecord {
    closure: u32,
    pc: usize,
    stack: Vec<ValueRecord>,
    varargs: Vec<ValueRecord>,
    top: usize,
    v: Vec<ValueRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StackRecord {
    frames: Vec<FrameRecord>,
    current_level: usize,
    host_level: usize,
    return_value: ValueRecord,
    user_end_call: bool,
    script_start_time: u64,
    root: ValueRecord,
    message_hook: Option<ValueRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum ValueRecord {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    /// Host function, by registry name.
    Native(String),
    Table(u32),
    UserData(u32),
    Closure(u32),
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum KeyRecord {
    Int(i64),
    Str(String),
    Bool(bool),
}

// ── Flatten ───────────────────────────────────────────────────────────────────

pub(crate) fn flatten(
    stack: &ExecutionStack,
    registry: &HostRegistry,
) -> Result<SnapshotGraph, SnapshotError> {
    let mut fl = Flattener {
        registry,
        protos: Vec::new(),
        proto_ids: HashMap::new(),
        tables: Vec::new(),
        table_ids: HashMap::new(),
        cells: Vec::new(),
        cell_ids: HashMap::new(),
        closures: Vec::new(),
        closure_ids: HashMap::new(),
    };

    let root = fl.value(&stack.root)?;
    if !matches!(root, ValueRecord::Closure(_)) {
        return Err(SnapshotError::BadGraph(
            "execution stack has no root closure".into(),
        ));
    }

    let frames = stack
        .frames
        .iter()
        .map(|f| fl.frame(f))
        .collect::<Result<Vec<_>, _>>()?;

    let message_hook = match &stack.message_hook {
        Some(v) => Some(fl.value(v)?),
        None => None,
    };

    let stack_record = StackRecord {
        frames,
        // On resume the splice machinery must engage at the deepest frame:
        // the pending-call level becomes the splice marker and the walk
        // restarts from the outermost frame.
        current_level: 0,
        host_level: stack.current_level,
        return_value: fl.value(&stack.return_value)?,
        user_end_call: stack.user_end_call,
        script_start_time: stack.script_start_time,
        root,
        message_hook,
    };

    Ok(SnapshotGraph {
        protos: fl.protos.into_iter().map(|r| r.expect("filled")).collect(),
        tables: fl.tables.into_iter().map(|r| r.expect("filled")).collect(),
        cells: fl.cells.into_iter().map(|r| r.expect("filled")).collect(),
        closures: fl
            .closures
            .into_iter()
            .map(|r| r.expect("filled"))
            .collect(),
        stack: stack_record,
    })
}

struct Flattener<'r> {
    registry: &'r HostRegistry,
    protos: Vec<Option<ProtoRecord>>,
    proto_ids: HashMap<usize, u32>,
    tables: Vec<Option<TableRecord>>,
    table_ids: HashMap<usize, u32>,
    cells: Vec<Option<CellRecord>>,
    cell_ids: HashMap<usize, u32>,
    closures: Vec<Option<ClosureRecord>>,
    closure_ids: HashMap<usize, u32>,
}

impl Flattener<'_> {
    fn value(&mut self, v: &LuaValue) -> Result<ValueRecord, SnapshotError> {
        Ok(match v {
            LuaValue::Nil => ValueRecord::Nil,
            LuaValue::Boolean(b) => ValueRecord::Boolean(*b),
            LuaValue::Integer(n) => ValueRecord::Integer(*n),
            LuaValue::Float(f) => ValueRecord::Float(*f),
            LuaValue::LuaString(s) => ValueRecord::Str(s.clone()),
            LuaValue::NativeFunction(f) => ValueRecord::Native(
                self.registry
                    .name_of(*f)
                    .ok_or(SnapshotError::UnregisteredNative)?
                    .to_string(),
            ),
            LuaValue::Table(t) => ValueRecord::Table(self.table(t)?),
            LuaValue::UserData(t) => ValueRecord::UserData(self.table(t)?),
            LuaValue::Closure(c) => ValueRecord::Closure(self.closure(c)?),
        })
    }

    fn table(&mut self, t: &Arc<RwLock<LuaTable>>) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(t) as usize;
        if let Some(id) = self.table_ids.get(&key) {
            return Ok(*id);
        }
        // Register the id before descending so cycles resolve to it.
        let id = self.tables.len() as u32;
        self.tables.push(None);
        self.table_ids.insert(key, id);

        let (array_src, hash_src, meta_src) = {
            let guard = t.read().unwrap();
            (
                guard.array.clone(),
                guard
                    .hash
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Vec<_>>(),
                guard.metatable.clone(),
            )
        };

        let array = array_src
            .iter()
            .map(|v| self.value(v))
            .collect::<Result<Vec<_>, _>>()?;
        let mut hash = Vec::with_capacity(hash_src.len());
        for (k, v) in &hash_src {
            let key = match k {
                HashKey::Int(n) => KeyRecord::Int(*n),
                HashKey::Str(s) => KeyRecord::Str(s.clone()),
                HashKey::Bool(b) => KeyRecord::Bool(*b),
            };
            hash.push((key, self.value(v)?));
        }
        let metatable = match &meta_src {
            Some(mt) => Some(self.table(mt)?),
            None => None,
        };

        self.tables[id as usize] = Some(TableRecord {
            array,
            hash,
            metatable,
        });
        Ok(id)
    }

    fn closure(&mut self, c: &Arc<LuaClosure>) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(c) as usize;
        if let Some(id) = self.closure_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.closures.len() as u32;
        self.closures.push(None);
        self.closure_ids.insert(key, id);

        let proto = self.proto(&c.proto)?;
        let env = self.value(&c.env)?;
        if !matches!(
            env,
            ValueRecord::Nil | ValueRecord::Table(_) | ValueRecord::UserData(_)
        ) {
            return Err(SnapshotError::BadGraph(
                "closure environment is not a table".into(),
            ));
        }
        let upvalues = c
            .upvalues
            .iter()
            .map(|cell| self.cell(cell))
            .collect::<Result<Vec<_>, _>>()?;

        self.closures[id as usize] = Some(ClosureRecord {
            proto,
            env,
            upvalues,
        });
        Ok(id)
    }

    fn cell(&mut self, cell: &Upvalue) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(&cell.0) as usize;
        if let Some(id) = self.cell_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.cells.len() as u32;
        self.cells.push(None);
        self.cell_ids.insert(key, id);

        let snapshot = cell.0.read().unwrap().clone();
        let record = match snapshot {
            UpvalueInner::Open { level, slot } => CellRecord::Open { level, slot },
            UpvalueInner::Closed(v) => CellRecord::Closed(self.value(&v)?),
        };
        self.cells[id as usize] = Some(record);
        Ok(id)
    }

    fn proto(&mut self, p: &Arc<Proto>) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(p) as usize;
        if let Some(id) = self.proto_ids.get(&key) {
            return Ok(*id);
        }
        let id = self.protos.len() as u32;
        self.protos.push(None);
        self.proto_ids.insert(key, id);

        let k = p
            .k
            .iter()
            .map(|v| self.value(v))
            .collect::<Result<Vec<_>, _>>()?;
        let children = p
            .p
            .iter()
            .map(|child| self.proto(child))
            .collect::<Result<Vec<_>, _>>()?;

        self.protos[id as usize] = Some(ProtoRecord {
            code: p.code.clone(),
            k,
            p: children,
            upvalues: p
                .upvalues
                .iter()
                .map(|d| (d.name.clone(), d.in_stack, d.index))
                .collect(),
            num_params: p.num_params,
            is_vararg: p.is_vararg,
            max_stack_size: p.max_stack_size,
            source: p.source.clone(),
            line_info: p.line_info.clone(),
        });
        Ok(id)
    }

    fn frame(&mut self, f: &Frame) -> Result<FrameRecord, SnapshotError> {
        Ok(FrameRecord {
            closure: self.closure(&f.closure)?,
            pc: f.pc,
            stack: f
                .stack
                .iter()
                .map(|v| self.value(v))
                .collect::<Result<Vec<_>, _>>()?,
            varargs: self.bundle(&f.varargs)?,
            top: f.top,
            v: self.bundle(&f.v)?,
        })
    }

    fn bundle(&mut self, v: &Varargs) -> Result<Vec<ValueRecord>, SnapshotError> {
        v.to_vec().iter().map(|v| self.value(v)).collect()
    }
}

// ── Rebuild ───────────────────────────────────────────────────────────────────

pub(crate) fn rebuild(
    graph: &SnapshotGraph,
    registry: &HostRegistry,
) -> Result<(Arc<LuaClosure>, ExecutionStack), SnapshotError> {
    let mut rb = Rebuilder {
        graph,
        registry,
        protos: vec![None; graph.protos.len()],
        tables: Vec::new(),
        cells: Vec::new(),
        closures: Vec::new(),
    };

    // Phase 1: shells. Tables and cells exist before anything points at
    // them; closures can then be built outright, since they only reference
    // protos, shells, and their environment table.
    for _ in &graph.tables {
        rb.tables.push(Arc::new(RwLock::new(LuaTable::new())));
    }
    for record in &graph.cells {
        rb.cells.push(match record {
            CellRecord::Open { level, slot } => Upvalue::open(*level, *slot),
            CellRecord::Closed(_) => Upvalue::closed(LuaValue::Nil),
        });
    }
    for record in &graph.closures {
        let proto = rb.proto(record.proto)?;
        let env = rb.value(&record.env)?;
        let upvalues = record
            .upvalues
            .iter()
            .map(|id| rb.cell_shell(*id))
            .collect::<Result<Vec<_>, _>>()?;
        rb.closures
            .push(Arc::new(LuaClosure::new(proto, env, upvalues)));
    }

    // Phase 2: contents, now that every reference target exists.
    for (id, record) in graph.tables.iter().enumerate() {
        let array = record
            .array
            .iter()
            .map(|v| rb.value(v))
            .collect::<Result<Vec<_>, _>>()?;
        let mut hash = HashMap::with_capacity(record.hash.len());
        for (k, v) in &record.hash {
            let key = match k {
                KeyRecord::Int(n) => HashKey::Int(*n),
                KeyRecord::Str(s) => HashKey::Str(s.clone()),
                KeyRecord::Bool(b) => HashKey::Bool(*b),
            };
            hash.insert(key, rb.value(v)?);
        }
        let metatable = match record.metatable {
            Some(mid) => Some(rb.table_shell(mid)?),
            None => None,
        };
        let mut guard = rb.tables[id].write().unwrap();
        guard.array = array;
        guard.hash = hash;
        guard.metatable = metatable;
    }
    for (id, record) in graph.cells.iter().enumerate() {
        if let CellRecord::Closed(v) = record {
            let value = rb.value(v)?;
            *rb.cells[id].0.write().unwrap() = UpvalueInner::Closed(value);
        }
    }

    // Frames and the stack itself.
    let root = match rb.value(&graph.stack.root)? {
        LuaValue::Closure(c) => c,
        _ => {
            return Err(SnapshotError::BadGraph(
                "snapshot root is not a closure".into(),
            ))
        }
    };

    let mut stack = ExecutionStack::new(LuaValue::Closure(Arc::clone(&root)));
    stack.frames = graph
        .stack
        .frames
        .iter()
        .map(|f| rb.frame(f))
        .collect::<Result<Vec<_>, _>>()?;
    stack.current_level = graph.stack.current_level;
    stack.host_level = graph.stack.host_level;
    stack.return_value = rb.value(&graph.stack.return_value)?;
    stack.user_end_call = graph.stack.user_end_call;
    stack.script_start_time = graph.stack.script_start_time;
    stack.message_hook = match &graph.stack.message_hook {
        Some(v) => Some(rb.value(v)?),
        None => None,
    };

    // Re-register any cells that were still open when the snapshot was cut.
    for (id, record) in graph.cells.iter().enumerate() {
        if let CellRecord::Open { level, slot } = record {
            stack.open_upvalues.push(OpenUpvalue {
                level: *level,
                slot: *slot,
                cell: rb.cells[id].clone(),
            });
        }
    }

    Ok((root, stack))
}

struct Rebuilder<'g> {
    graph: &'g SnapshotGraph,
    registry: &'g HostRegistry,
    protos: Vec<Option<Arc<Proto>>>,
    tables: Vec<Arc<RwLock<LuaTable>>>,
    cells: Vec<Upvalue>,
    closures: Vec<Arc<LuaClosure>>,
}

impl Rebuilder<'_> {
    /// Build (and memoize) the prototype for `id`, children first.
    fn proto(&mut self, id: u32) -> Result<Arc<Proto>, SnapshotError> {
        if let Some(Some(p)) = self.protos.get(id as usize) {
            return Ok(Arc::clone(p));
        }
        let record = self
            .graph
            .protos
            .get(id as usize)
            .ok_or_else(|| SnapshotError::BadGraph(format!("prototype id {id} out of range")))?;

        // Interning order guarantees children carry larger ids than their
        // parent, so this recursion terminates on any well-formed graph.
        if record.p.iter().any(|child| *child <= id) {
            return Err(SnapshotError::BadGraph(
                "prototype tree is not topologically ordered".into(),
            ));
        }
        let children = record
            .p
            .iter()
            .map(|child| self.proto(*child))
            .collect::<Result<Vec<_>, _>>()?;
        let k = record
            .k
            .iter()
            .map(|v| self.value(v))
            .collect::<Result<Vec<_>, _>>()?;

        let proto = Arc::new(Proto {
            code: record.code.clone(),
            k,
            p: children,
            upvalues: record
                .upvalues
                .iter()
                .map(|(name, in_stack, index)| UpvalueDesc {
                    name: name.clone(),
                    in_stack: *in_stack,
                    index: *index,
                })
                .collect(),
            num_params: record.num_params,
            is_vararg: record.is_vararg,
            max_stack_size: record.max_stack_size,
            source: record.source.clone(),
            line_info: record.line_info.clone(),
        });
        self.protos[id as usize] = Some(Arc::clone(&proto));
        Ok(proto)
    }

    fn table_shell(&self, id: u32) -> Result<Arc<RwLock<LuaTable>>, SnapshotError> {
        self.tables
            .get(id as usize)
            .cloned()
            .ok_or_else(|| SnapshotError::BadGraph(format!("table id {id} out of range")))
    }

    fn cell_shell(&self, id: u32) -> Result<Upvalue, SnapshotError> {
        self.cells
            .get(id as usize)
            .cloned()
            .ok_or_else(|| SnapshotError::BadGraph(format!("upvalue cell id {id} out of range")))
    }

    fn value(&mut self, v: &ValueRecord) -> Result<LuaValue, SnapshotError> {
        Ok(match v {
            ValueRecord::Nil => LuaValue::Nil,
            ValueRecord::Boolean(b) => LuaValue::Boolean(*b),
            ValueRecord::Integer(n) => LuaValue::Integer(*n),
            ValueRecord::Float(f) => LuaValue::Float(*f),
            ValueRecord::Str(s) => LuaValue::LuaString(s.clone()),
            ValueRecord::Native(name) => LuaValue::NativeFunction(
                self.registry
                    .get(name)
                    .ok_or_else(|| SnapshotError::UnknownNative(name.clone()))?,
            ),
            ValueRecord::Table(id) => LuaValue::Table(self.table_shell(*id)?),
            ValueRecord::UserData(id) => LuaValue::UserData(self.table_shell(*id)?),
            ValueRecord::Closure(id) => LuaValue::Closure(
                self.closures
                    .get(*id as usize)
                    .cloned()
                    .ok_or_else(|| {
                        SnapshotError::BadGraph(format!("closure id {id} out of range"))
                    })?,
            ),
        })
    }

    fn frame(&mut self, record: &FrameRecord) -> Result<Frame, SnapshotError> {
        let closure = self
            .closures
            .get(record.closure as usize)
            .cloned()
            .ok_or_else(|| {
                SnapshotError::BadGraph(format!("closure id {} out of range", record.closure))
            })?;
        let mut frame = Frame::new(closure);
        frame.pc = record.pc;
        frame.stack = record
            .stack
            .iter()
            .map(|v| self.value(v))
            .collect::<Result<Vec<_>, _>>()?;
        frame.varargs = Varargs::from(
            record
                .varargs
                .iter()
                .map(|v| self.value(v))
                .collect::<Result<Vec<_>, _>>()?,
        );
        frame.top = record.top;
        frame.v = Varargs::from(
            record
                .v
                .iter()
                .map(|v| self.value(v))
                .collect::<Result<Vec<_>, _>>()?,
        );
        Ok(frame)
    }
}
