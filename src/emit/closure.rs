use crate::code::{CodeIter, Opcode};
use crate::emit::{BlockKind, Emitter};
use crate::symtab::{VarId, VarKind};
use crate::types::TypeFlags;
use crate::vm::LilyResult;

const NOT_IN_CLOSURE: u16 = u16::MAX;

impl Emitter {
    /// Record that 'var' is closed over, returning its closure spot.
    /// Spots are numbered in insertion order and shared by the whole
    /// closure tree under one backing function.
    pub(crate) fn close_over_var(&mut self, id: VarId) -> LilyResult<u16> {
        let var = self.symtab.var(id).clone();
        let (reg, depth) = match var.kind {
            VarKind::Local { reg, depth } => (reg, depth),
            _ => return Err(self.error("Only locals can be closed over.")),
        };

        if self.in_define_chain()
            && var.ty.flags.contains(TypeFlags::IS_UNRESOLVED)
        {
            return Err(self.error(
                "Cannot close over a var of an incomplete type in this scope.",
            ));
        }

        if depth == self.class_block_depth() && self.class_block_depth() != 0 {
            return Err(self.error(
                "Not allowed to close over variables from a class constructor.",
            ));
        }

        self.mark_make_closure();

        if let Some(spot) = self
            .closure_spots
            .iter()
            .position(|&(r, d)| r == reg && d == depth)
        {
            return Ok(spot as u16);
        }

        self.closure_spots.push((reg, depth));
        Ok((self.closure_spots.len() - 1) as u16)
    }

    /// The first line number found in the given code range, for the
    /// synthetic loads the transform writes.
    fn first_line_in(&self, start: u16, stop: u16) -> u16 {
        let buffer = self.code.as_slice();
        let mut ci = CodeIter::new(buffer, start as usize, stop as usize);

        while ci.next() {
            if ci.line == 1 {
                return buffer[ci.line_pos()];
            }
        }

        0
    }

    /// Rewrite the finished function's code into the closure aux buffer:
    /// reads from closed-over registers are preceded by closure_get,
    /// writes are followed by closure_set, and every jump is re-aimed at
    /// where its target landed. Returns the cell count of the closure.
    pub(crate) fn perform_closure_transform(
        &mut self,
        code_start: u16,
        code_stop: u16,
    ) -> LilyResult<u16> {
        self.closure_aux = crate::code::CodeBuffer::new();

        let first_line = self.first_line_in(code_start, code_stop);
        let spot_count = self.closure_spots.len() as u16;

        // The backing function owns the cells. Everything nested shares
        // them through closure_function copies.
        let is_backing = self.prev_function_is_backing();

        if is_backing {
            // The closure itself lands in a register so the gc treats it
            // as rooted for this activation.
            let closure_reg = self.alloc_reg();
            self.closure_aux.write_4(
                Opcode::ClosureNew.into(),
                spot_count,
                closure_reg,
                first_line,
            );
        }

        // Transform table: register -> closure spot for spots owned by
        // this function's depth.
        let reg_count = self.next_reg_spot() as usize;
        self.transform_table = vec![NOT_IN_CLOSURE; reg_count];

        let depth = self.function_depth;
        let param_count = self.current_param_count();

        for i in 0..self.closure_spots.len() {
            let (reg, spot_depth) = self.closure_spots[i];
            if spot_depth == depth {
                if reg < param_count {
                    // Parameters exist before any code runs; seed their
                    // cells on entry.
                    self.closure_aux.write_4(
                        Opcode::ClosureSet.into(),
                        i as u16,
                        reg,
                        first_line,
                    );
                }
                self.transform_table[reg as usize] = i as u16;
                // Claimed: other closures at this level must not treat
                // this local as theirs.
                self.closure_spots[i].1 = u16::MAX;
            }
        }

        if is_backing {
            self.closure_spots.clear();
        }

        let source = self.code.extract(code_start, code_stop);

        // Pass one: collect every jump destination, ordered, with room to
        // note where each target lands in the new code.
        let mut jump_map: Vec<(usize, usize)> = Vec::new();
        {
            let mut ci = CodeIter::new(&source, 0, source.len());
            while ci.next() {
                let start = ci.jump_start();
                for i in 0..ci.jumps {
                    let slot = start + i;
                    let word = source[slot];
                    // Exception catches write 0 to mean "chain ends".
                    if word == 0 {
                        continue;
                    }
                    let dest = slot.wrapping_add(word as i16 as isize as usize);
                    match jump_map.binary_search_by_key(&dest, |e| e.0) {
                        Ok(_) => {}
                        Err(at) => jump_map.insert(at, (dest, 0)),
                    }
                }
            }
        }

        // Pass two: copy instruction by instruction, inserting cell loads
        // and stores, noting where every jump target lands and where
        // every jump operand now sits.
        let mut fixups: Vec<(u16, usize)> = Vec::new();
        let mut map_iter = 0usize;

        let mut ci = CodeIter::new(&source, 0, source.len());
        while ci.next() {
            let op = ci.opcode;

            // The register form of a call reads its target like an input.
            if ci.specials > 0 && op == Opcode::CallRegister {
                self.maybe_get(&source, ci.special_start(), first_line);
            }

            let input_start = ci.input_start();
            for i in 0..ci.inputs {
                self.maybe_get(&source, input_start + i, first_line);
            }

            if map_iter < jump_map.len() && jump_map[map_iter].0 == ci.offset {
                jump_map[map_iter].1 = self.closure_aux.pos() as usize;
                map_iter += 1;
            }

            // Copy the fixed front of the instruction.
            let copy_stop = ci.offset + ci.round_total - ci.jumps - ci.line;
            for i in ci.offset..copy_stop {
                self.closure_aux.write(source[i]);
            }

            // Jump operands: note the slot and the original destination;
            // the actual distance is fixed in pass three.
            for i in 0..ci.jumps {
                let slot = copy_stop + i;
                let word = source[slot];
                if word == 0 {
                    self.closure_aux.write(0);
                } else {
                    let dest = slot.wrapping_add(word as i16 as isize as usize);
                    fixups.push((self.closure_aux.pos(), dest));
                    self.closure_aux.write(0);
                }
            }

            if ci.line == 1 {
                self.closure_aux.write(source[ci.line_pos()]);
            }

            let output_start = ci.output_start();
            for i in 0..ci.outputs {
                self.maybe_set(&source, output_start + i, first_line);
            }
        }

        // Pass three: re-aim the jumps. A jump's new distance pulls back
        // past the closure_get loads inserted in front of its target, so
        // the reloads run before the landed-on opcode.
        for (aux_slot, orig_dest) in fixups {
            let entry = jump_map
                .iter()
                .find(|e| e.0 == orig_dest)
                .ok_or_else(|| self.error("Closure transform lost a jump target."))?;

            let tx_offset = self.count_transforms(&source, orig_dest) * 4;
            let new_target = entry.1 - tx_offset;
            let distance = (new_target as isize - aux_slot as isize) as i16;
            self.closure_aux.set_at(aux_slot, distance as u16);
        }

        Ok(spot_count)
    }

    fn maybe_get(&mut self, source: &[u16], pos: usize, line: u16) {
        let reg = source[pos];
        let spot = self.transform_table.get(reg as usize).copied().unwrap_or(NOT_IN_CLOSURE);
        if spot != NOT_IN_CLOSURE {
            self.closure_aux
                .write_4(Opcode::ClosureGet.into(), spot, reg, line);
        }
    }

    fn maybe_set(&mut self, source: &[u16], pos: usize, line: u16) {
        let reg = source[pos];
        let spot = self.transform_table.get(reg as usize).copied().unwrap_or(NOT_IN_CLOSURE);
        if spot != NOT_IN_CLOSURE {
            self.closure_aux
                .write_4(Opcode::ClosureSet.into(), spot, reg, line);
        }
    }

    /// How many cell loads the transform inserted in front of the
    /// instruction at 'start'.
    fn count_transforms(&self, source: &[u16], start: usize) -> usize {
        let mut ci = CodeIter::new(source, start, source.len());
        if !ci.next() {
            return 0;
        }

        let mut count = 0;

        if ci.specials > 0 && ci.opcode == Opcode::CallRegister {
            let reg = source[ci.special_start()];
            let spot = self.transform_table.get(reg as usize).copied().unwrap_or(NOT_IN_CLOSURE);
            if spot != NOT_IN_CLOSURE {
                count += 1;
            }
        }

        let input_start = ci.input_start();
        for i in 0..ci.inputs {
            let reg = source[input_start + i];
            let spot = self.transform_table.get(reg as usize).copied().unwrap_or(NOT_IN_CLOSURE);
            if spot != NOT_IN_CLOSURE {
                count += 1;
            }
        }

        count
    }
}

impl Emitter {
    pub(crate) fn in_define_chain(&self) -> bool {
        self.block_kind_of_function() == BlockKind::Define
            && self.prev_function_kind() == BlockKind::Define
    }
}
