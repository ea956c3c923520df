/*!
Call site location and control flow inside a single function.

Emulation never evaluates branch conditions. Instead the resolver picks the
shortest block path from the function entry to the call site and replays the
instructions along it.
*/

use crate::arch::Bitness;
use crate::error::{Error, Result};
use crate::image::KernelImage;
use crate::symbols::SymbolSource;

use memflow::prelude::v1::Address;

use iced_x86::*;

use log::*;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Range;

/// A direct call from an anchor function to a target function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    /// Entry of the anchor function.
    pub function: Address,
    /// End of the decoded range of the anchor function.
    pub end: Address,
    /// Address of the call instruction.
    pub call: Address,
    /// Resolved address of the callee.
    pub target: Address,
}

/// Code of the function starting at `start`.
///
/// The extent comes from the unwind tables when the image has them, otherwise
/// `window` bytes are taken, cut at the end of the image.
pub fn function_code(image: &KernelImage, start: Address, window: usize) -> Result<&[u8]> {
    let available = image.bytes_from(start).ok_or_else(|| {
        Error::InvalidImage(format!("function {:x} is outside of the image", start))
    })?;

    let len = match image.function_extent(start) {
        Some(extent) => (extent.end.to_umem() - start.to_umem()) as usize,
        None => window,
    };

    Ok(&available[..len.min(available.len())])
}

/// Finds the first direct near call to `target` reachable from the entry of `anchor`.
///
/// Returns the call site along with the control flow of the anchor, which is
/// what the call was searched in. Code following a return, such as the next
/// function when the extent is only a scan window, is never considered.
pub fn locate_call_in_fn(
    image: &KernelImage,
    symbols: &dyn SymbolSource,
    anchor: &str,
    target: &str,
    window: usize,
) -> Result<(CallSite, ControlFlow)> {
    let function = symbols
        .resolve(anchor)
        .ok_or_else(|| Error::SymbolNotFound(anchor.into()))?;

    let callee = symbols
        .resolve(target)
        .ok_or_else(|| Error::SymbolNotFound(target.into()))?;

    debug!("{}: {:x}, {}: {:x}", anchor, function, target, callee);

    let code = function_code(image, function, window)?;

    let flow = ControlFlow::build(image.bitness(), code, function.to_umem() as u64);

    let call = flow
        .find_call(callee.to_umem() as u64)
        .ok_or_else(|| Error::CallSiteNotFound {
            anchor: anchor.into(),
            target: target.into(),
        })?;

    let site = CallSite {
        function,
        end: function + code.len(),
        call: Address::from(call),
        target: callee,
    };

    debug!("call site: {:x}", site.call);

    Ok((site, flow))
}

#[derive(Clone, Debug, Default)]
struct Block {
    instructions: Vec<Instruction>,
    successors: Vec<u64>,
}

/// Basic blocks of one function, keyed by their start address.
#[derive(Clone, Debug)]
pub struct ControlFlow {
    entry: u64,
    blocks: BTreeMap<u64, Block>,
}

impl ControlFlow {
    pub fn build(bitness: Bitness, code: &[u8], entry: u64) -> Self {
        let range = entry..(entry + code.len() as u64);

        let mut decoder = Decoder::new(bitness.bits(), code, DecoderOptions::NONE);
        decoder.set_ip(entry);

        let instructions = decoder.into_iter().collect::<Vec<_>>();

        let mut leaders = BTreeSet::new();
        leaders.insert(entry);

        for instr in &instructions {
            if let Some(successors) = terminator_successors(instr, &range) {
                leaders.extend(successors);
                leaders.insert(instr.next_ip());
            }
        }

        let mut blocks = BTreeMap::new();
        let mut current: Option<(u64, Block)> = None;

        for instr in instructions {
            let ip = instr.ip();

            let (start, mut block) = match current.take() {
                Some((start, block)) if !leaders.contains(&ip) => (start, block),
                Some((start, mut block)) => {
                    block.successors.push(ip);
                    blocks.insert(start, block);
                    (ip, Block::default())
                }
                None => (ip, Block::default()),
            };

            block.instructions.push(instr);

            match terminator_successors(&instr, &range) {
                Some(successors) => {
                    block.successors = successors;
                    blocks.insert(start, block);
                }
                None => current = Some((start, block)),
            }
        }

        if let Some((start, block)) = current {
            blocks.insert(start, block);
        }

        trace!("{} blocks at {:x}", blocks.len(), entry);

        Self { entry, blocks }
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Start addresses of the blocks reachable from the entry.
    fn reachable(&self) -> BTreeSet<u64> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();

        if self.blocks.contains_key(&self.entry) {
            seen.insert(self.entry);
            queue.push_back(self.entry);
        }

        while let Some(start) = queue.pop_front() {
            let block = match self.blocks.get(&start) {
                Some(block) => block,
                None => continue,
            };

            for &next in &block.successors {
                if self.blocks.contains_key(&next) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        seen
    }

    /// Address of the lowest reachable direct near call to `target`.
    pub fn find_call(&self, target: u64) -> Option<u64> {
        self.reachable()
            .iter()
            .filter_map(|start| self.blocks.get(start))
            .flat_map(|block| block.instructions.iter())
            .find(|instr| instr.is_call_near() && instr.near_branch_target() == target)
            .map(|instr| instr.ip())
    }

    fn block_containing(&self, ip: u64) -> Option<u64> {
        self.blocks
            .range(..=ip)
            .next_back()
            .filter(|(_, block)| block.instructions.iter().any(|i| i.ip() == ip))
            .map(|(start, _)| *start)
    }

    /// Instructions along the shortest block path from the entry up to, but
    /// excluding, the instruction at `target`.
    pub fn path_to(&self, target: u64) -> Option<Vec<Instruction>> {
        let goal = self.block_containing(target)?;

        let mut parents = HashMap::new();
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();

        seen.insert(self.entry);
        queue.push_back(self.entry);

        while let Some(start) = queue.pop_front() {
            if start == goal {
                break;
            }

            let block = match self.blocks.get(&start) {
                Some(block) => block,
                None => continue,
            };

            for &next in &block.successors {
                if self.blocks.contains_key(&next) && seen.insert(next) {
                    parents.insert(next, start);
                    queue.push_back(next);
                }
            }
        }

        if !seen.contains(&goal) {
            return None;
        }

        let mut chain = vec![goal];
        while let Some(parent) = parents.get(chain.last()?) {
            chain.push(*parent);
        }
        chain.reverse();

        trace!("path to {:x}: {:x?}", target, chain);

        Some(
            chain
                .iter()
                .filter_map(|start| self.blocks.get(start))
                .flat_map(|block| block.instructions.iter().copied())
                .take_while(|instr| instr.ip() != target)
                .collect(),
        )
    }
}

/// Successors of a block ending in `instr`, or `None` if `instr` does not end a block.
fn terminator_successors(instr: &Instruction, range: &Range<u64>) -> Option<Vec<u64>> {
    if instr.is_invalid() {
        return Some(vec![]);
    }

    let inside = |ip: &u64| range.contains(ip);

    match instr.flow_control() {
        FlowControl::ConditionalBranch => Some(
            [instr.near_branch_target(), instr.next_ip()]
                .iter()
                .copied()
                .filter(inside)
                .collect(),
        ),
        FlowControl::UnconditionalBranch => Some(
            Some(instr.near_branch_target())
                .filter(inside)
                .into_iter()
                .collect(),
        ),
        FlowControl::IndirectBranch
        | FlowControl::Return
        | FlowControl::Interrupt
        | FlowControl::Exception => Some(vec![]),
        _ => None,
    }
}
