use std::collections::HashSet;

/// Links an instruction index to a source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapEntry {
    pub instruction_index: usize,
    pub source_line: i32,
    pub source_column: i32,
    pub file_index: i32,
}

#[derive(Debug, Clone)]
pub struct FunctionInfo {
    pub name: String,
    pub start_instruction: usize,
    pub end_instruction: usize,
    pub file_index: i32,
    pub source_line: i32,
    pub source_column: i32,
    pub parameter_count: usize,
    pub local_variable_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Register,
    Global,
    Constant,
}

#[derive(Debug, Clone, Copy)]
pub struct VariableLocation {
    pub kind: LocationKind,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct VariableInfo {
    pub name: String,
    pub type_name: String,
    pub start_instruction: usize,
    /// `None` means the variable is live to the end of the program.
    pub end_instruction: Option<usize>,
    pub location: VariableLocation,
}

#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: String,
    pub content: Option<String>,
}

/// Immutable debug payload loaded alongside the bytecode.
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub source_map: Vec<SourceMapEntry>,
    pub functions: Vec<FunctionInfo>,
    pub variables: Vec<VariableInfo>,
    pub files: Vec<FileInfo>,
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: i32,
    pub instruction_index: usize,
    pub source_line: i32,
    pub file_index: i32,
    pub enabled: bool,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    #[default]
    None,
    StepIn,
    StepOver,
    StepOut,
}

/// Breakpoints and stepping state shared between the DAP handler and the
/// interpreter. The handler mutates it; the dispatch loop consults it at
/// every instruction while debug mode is on.
#[derive(Debug, Default)]
pub struct DebugState {
    info: Option<DebugInfo>,
    breakpoints: Vec<Breakpoint>,
    instruction_breakpoints: HashSet<usize>,
    next_breakpoint_id: i32,
    step_mode: StepMode,
    step_over_depth: usize,
    step_out_depth: usize,
    last_step: Option<(i32, i32)>,
}

impl DebugState {
    pub fn new() -> DebugState {
        DebugState {
            next_breakpoint_id: 1,
            ..DebugState::default()
        }
    }

    pub fn set_debug_info(&mut self, info: DebugInfo) {
        self.info = Some(info);
    }

    pub fn has_debug_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn info(&self) -> Option<&DebugInfo> {
        self.info.as_ref()
    }

    /// Resolve a source line to an instruction and register a breakpoint
    /// there. Returns the breakpoint id, or `None` when the line maps to no
    /// instruction (the request fails verification).
    pub fn add_breakpoint(&mut self, source_line: i32, file_index: i32) -> Option<i32> {
        let instruction_index = self.instruction_for_source(source_line, file_index)?;
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        self.breakpoints.push(Breakpoint {
            id,
            instruction_index,
            source_line,
            file_index,
            enabled: true,
            condition: None,
        });
        self.rebuild_instruction_breakpoints();
        Some(id)
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
        self.rebuild_instruction_breakpoints();
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn has_breakpoint_at(&self, instruction_index: usize) -> bool {
        self.instruction_breakpoints.contains(&instruction_index)
    }

    fn rebuild_instruction_breakpoints(&mut self) {
        self.instruction_breakpoints = self
            .breakpoints
            .iter()
            .filter(|bp| bp.enabled)
            .map(|bp| bp.instruction_index)
            .collect();
    }

    /// First instruction mapped to the exact (line, file) pair.
    pub fn instruction_for_source(&self, source_line: i32, file_index: i32) -> Option<usize> {
        let info = self.info.as_ref()?;
        info.source_map
            .iter()
            .find(|e| e.source_line == source_line && e.file_index == file_index)
            .map(|e| e.instruction_index)
    }

    /// Source entry for an instruction, falling back to the nearest
    /// preceding mapped instruction.
    pub fn source_for_instruction(&self, instruction_index: usize) -> Option<SourceMapEntry> {
        let info = self.info.as_ref()?;
        if let Some(exact) = info
            .source_map
            .iter()
            .find(|e| e.instruction_index == instruction_index)
        {
            return Some(*exact);
        }
        info.source_map
            .iter()
            .filter(|e| e.instruction_index <= instruction_index)
            .max_by_key(|e| e.instruction_index)
            .copied()
    }

    pub fn function_at(&self, instruction_index: usize) -> Option<&FunctionInfo> {
        self.info.as_ref()?.functions.iter().find(|f| {
            instruction_index >= f.start_instruction && instruction_index <= f.end_instruction
        })
    }

    /// Variables whose live range covers the instruction.
    pub fn variables_in_scope(&self, instruction_index: usize) -> Vec<VariableInfo> {
        let Some(info) = self.info.as_ref() else {
            return Vec::new();
        };
        info.variables
            .iter()
            .filter(|v| {
                instruction_index >= v.start_instruction
                    && v.end_instruction
                        .map_or(true, |end| instruction_index <= end)
            })
            .cloned()
            .collect()
    }

    pub fn set_step_mode(&mut self, mode: StepMode) {
        self.step_mode = mode;
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    pub fn set_step_over_depth(&mut self, depth: usize) {
        self.step_over_depth = depth;
    }

    pub fn set_step_out_depth(&mut self, depth: usize) {
        self.step_out_depth = depth;
    }

    pub fn set_step_from_line(&mut self, line: i32, file_index: i32) {
        self.last_step = Some((line, file_index));
    }

    /// Whether the current stepping mode requires a stop at this instruction
    /// and call depth.
    pub fn should_break_on_step(&self, current_instruction: usize, call_depth: usize) -> bool {
        if self.step_mode == StepMode::None {
            return false;
        }
        let Some(location) = self.source_for_instruction(current_instruction) else {
            return false;
        };
        // First step after launch: stop at the first mapped line.
        let Some((last_line, last_file)) = self.last_step else {
            return true;
        };
        let different_line =
            location.source_line != last_line || location.file_index != last_file;
        match self.step_mode {
            StepMode::StepIn => different_line,
            StepMode::StepOver => different_line && call_depth <= self.step_over_depth,
            StepMode::StepOut => call_depth < self.step_out_depth,
            StepMode::None => false,
        }
    }
}
