//! Goblin-based multi-format binary loader.

use std::fmt;
use std::path::Path;

use goblin::elf::section_header::SHF_ALLOC;
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use goblin::mach::{constants::cputype, Mach, MachO, SingleArch};
use goblin::{elf, pe, Object};

use crate::expr::{Endianness, Expr, IntType};
use crate::program::{Program, Relocation, Section};
use crate::{Address, Architecture, DisassemblyError};

/// A loader that turns ELF, PE, and Mach-O images into a [`Program`] via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    /// Parse an in-memory image.
    pub fn parse(&self, data: &[u8]) -> Result<Program, DisassemblyError> {
        match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf, data),
            Ok(Object::PE(pe)) => self.parse_pe(pe, data),
            Ok(Object::Mach(m)) => self.parse_mach(m),
            Ok(_) => Err(DisassemblyError::ParsingError("Unsupported file format".into())),
            Err(e) => Err(DisassemblyError::ParsingError(e.to_string())),
        }
    }

    /// Read and parse the image at `path`.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<Program, DisassemblyError> {
        let data = std::fs::read(path)?;
        self.parse(&data)
    }

    /// Parse an ELF image.
    fn parse_elf(&self, elf: elf::Elf, img: &[u8]) -> Result<Program, DisassemblyError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            elf::header::EM_MIPS => Architecture::Mips32,
            elf::header::EM_RISCV => {
                // Determine RISC-V bitness from ELF class
                match elf.header.e_ident[elf::header::EI_CLASS] {
                    elf::header::ELFCLASS32 => Architecture::RiscV32,
                    elf::header::ELFCLASS64 => Architecture::RiscV64,
                    _ => Architecture::Unknown,
                }
            }
            _ => Architecture::Unknown,
        };

        let mut program = Program::new(arch);
        for sh in &elf.section_headers {
            if sh.sh_flags & SHF_ALLOC as u64 == 0 || sh.sh_addr == 0 {
                continue;
            }
            let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("");
            // NOBITS sections have no file range and read as zero
            let data = sh
                .file_range()
                .and_then(|range| img.get(range))
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            program.sections.push(
                Section::new(name, sh.sh_addr, data)
                    .with_virtual_size(sh.sh_size as usize)
                    .with_executable(sh.is_executable()),
            );
        }

        for (symtab, strtab) in [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)] {
            for sym in symtab.iter() {
                if sym.st_shndx == 0 || !matches!(sym.st_type(), STT_FUNC | STT_OBJECT) {
                    continue;
                }
                if let Some(name) = strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) {
                    export(&mut program, name, sym.st_value);
                }
            }
        }

        let width = if elf.is_64 { IntType::U64 } else { IntType::U32 };
        let endianness = if elf.little_endian {
            Endianness::Little
        } else {
            Endianness::Big
        };
        for reloc in elf.pltrelocs.iter().chain(elf.dynrelas.iter()).chain(elf.dynrels.iter()) {
            let Some(sym) = elf.dynsyms.get(reloc.r_sym) else {
                continue;
            };
            if sym.st_shndx != 0 {
                continue;
            }
            let Some(name) = elf.dynstrtab.get_at(sym.st_name).filter(|n| !n.is_empty()) else {
                continue;
            };
            let target = match reloc.r_addend {
                Some(addend) if addend != 0 => Expr::label(name) + Expr::constant(addend),
                _ => Expr::label(name),
            };
            relocate(&mut program, reloc.r_offset, Relocation::new(width, endianness, target));
        }

        if elf.entry != 0 {
            program.entry_point = Some(elf.entry);
            export(&mut program, "entrypoint", elf.entry);
        }
        log::debug!(
            "loaded ELF {}: {} sections, entry {:?}",
            arch,
            program.sections.len(),
            program.entry_point
        );
        Ok(program)
    }

    /// Parse a PE image.
    fn parse_pe(&self, pe: pe::PE<'_>, img: &[u8]) -> Result<Program, DisassemblyError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };
        let image_base = pe.image_base as Address;

        let mut program = Program::new(arch);
        for sect in &pe.sections {
            let start = sect.pointer_to_raw_data as usize;
            let raw_len = sect.size_of_raw_data as usize;
            let data = img
                .get(start..start.saturating_add(raw_len))
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            let executable = sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0;
            program.sections.push(
                Section::new(sect.name().unwrap_or(""), image_base + sect.virtual_address as Address, data)
                    .with_virtual_size(sect.virtual_size as usize)
                    .with_executable(executable),
            );
        }

        for exp in &pe.exports {
            if let Some(name) = exp.name {
                export(&mut program, name, image_base + exp.rva as Address);
            }
        }

        let width = if pe.is_64 { IntType::U64 } else { IntType::U32 };
        for import in &pe.imports {
            relocate(
                &mut program,
                image_base + import.rva as Address,
                Relocation::new(width, Endianness::Little, Expr::label(&import.name)),
            );
        }

        let entry = image_base + pe.entry as Address;
        program.entry_point = Some(entry);
        export(&mut program, "entrypoint", entry);
        log::debug!(
            "loaded PE {}: {} sections, {} imports",
            arch,
            program.sections.len(),
            pe.imports.len()
        );
        Ok(program)
    }

    /// Parse a thin Mach-O binary; segments stand in for sections.
    fn parse_macho(&self, macho: &MachO) -> Result<Program, DisassemblyError> {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let mut program = Program::new(arch);
        for segment in &macho.segments {
            if segment.vmsize == 0 {
                continue;
            }
            // VM_PROT_EXECUTE
            let executable = segment.initprot & 0x4 != 0;
            program.sections.push(
                Section::new(segment.name().unwrap_or(""), segment.vmaddr, segment.data.to_vec())
                    .with_virtual_size(segment.vmsize as usize)
                    .with_executable(executable),
            );
        }

        if let Some(symbols) = &macho.symbols {
            for (name, nlist) in symbols.iter().flatten() {
                if !nlist.is_undefined() && nlist.n_sect != 0 && !name.is_empty() {
                    export(&mut program, name, nlist.n_value);
                }
            }
        }

        if macho.entry != 0 {
            program.entry_point = Some(macho.entry);
        }
        Ok(program)
    }

    /// Parse a Mach-O image, taking the first thin slice of a fat archive.
    fn parse_mach(&self, m: Mach<'_>) -> Result<Program, DisassemblyError> {
        match m {
            Mach::Binary(binary) => self.parse_macho(&binary),
            Mach::Fat(fat) => {
                for arch in &fat {
                    if let Ok(SingleArch::MachO(macho)) = arch {
                        return self.parse_macho(&macho);
                    }
                }
                Err(DisassemblyError::ParsingError("Fat Mach-O without a Mach-O slice".into()))
            }
        }
    }
}

/// Export `name` from the section mapping `addr`; unmapped addresses are skipped.
fn export(program: &mut Program, name: &str, addr: Address) {
    match program.sections.iter_mut().find(|s| s.contains(addr)) {
        Some(section) => {
            let offset = (addr - section.base) as usize;
            section.exports.entry(name.to_string()).or_insert(offset);
        }
        None => log::trace!("symbol {} at 0x{:x} is not mapped", name, addr),
    }
}

/// Attach `relocation` to the section byte at `addr`.
fn relocate(program: &mut Program, addr: Address, relocation: Relocation) {
    match program.sections.iter_mut().find(|s| s.contains(addr)) {
        Some(section) => {
            let offset = (addr - section.base) as usize;
            section.relocations.insert(offset, relocation);
        }
        None => log::trace!("relocation at 0x{:x} is not mapped", addr),
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}
