#![allow(dead_code)]

pub const BTREE_SEARCH_KEY: &str = "?BTreeSearchKey@?$B_TREE@T_SM_PAGE_KEY@@USMKM_FRONTEND_ENTRY@@$0BAA@UNodeEmpty@@@@SAXPEAU1@T_SM_PAGE_KEY@@PEAUSEARCH_RESULT@1@@Z";
pub const SM_FE_CHECK_PRESENT: &str =
    "?SmFeCheckPresent@?$SMKM_STORE_MGR@USM_TRAITS@@@@SAJPEAU1@KPEAU_SM_PAGE_KEY@@@Z";

pub fn hex(s: &str) -> Vec<u8> {
    s.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).expect("invalid hex byte"))
        .collect()
}

pub fn call_rel32(ip: u64, target: u64) -> Vec<u8> {
    let rel = target.wrapping_sub(ip + 5) as u32;
    let mut bytes = vec![0xe8];
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes
}

/// Function body assembled at a fixed address.
pub struct Asm {
    pub ip: u64,
    pub code: Vec<u8>,
}

impl Asm {
    pub fn new(ip: u64) -> Self {
        Self { ip, code: vec![] }
    }

    pub fn here(&self) -> u64 {
        self.ip + self.code.len() as u64
    }

    pub fn bytes(&mut self, s: &str) -> &mut Self {
        self.code.extend(hex(s));
        self
    }

    pub fn call(&mut self, target: u64) -> &mut Self {
        let call = call_rel32(self.here(), target);
        self.code.extend(call);
        self
    }

    /// Emits a short conditional jump with a placeholder displacement and
    /// returns its position for `patch_jcc`.
    pub fn jcc(&mut self, opcode: u8) -> usize {
        self.code.extend([opcode, 0]);
        self.code.len() - 2
    }

    /// Points the jump emitted at `pos` to the current position.
    pub fn patch_jcc(&mut self, pos: usize) {
        self.code[pos + 1] = (self.code.len() - (pos + 2)) as u8;
    }
}

/// `SmFeCheckPresent` as built for Windows 10 1809 x64, up to and around its
/// call to `BTreeSearchKey`.
pub fn sm_fe_check_present_x64(ip: u64, btree_search_key: u64) -> Vec<u8> {
    let mut asm = Asm::new(ip);

    asm.bytes("53") // push rbx
        .bytes("57") // push rdi
        .bytes("48 81 ec 48 01 00 00") // sub rsp, 148h
        .bytes("48 8b f9") // mov rdi, rcx
        .bytes("8b da") // mov ebx, edx
        .bytes("85 d2"); // test edx, edx
    let fail = asm.jcc(0x74); // je fail
    asm.bytes("48 8d 8f c0 01 00 00") // lea rcx, [rdi+1C0h]
        .bytes("41 8b 04 24") // mov eax, [r12]
        .bytes("4c 8d 44 24 40") // lea r8, [rsp+40h]
        .bytes("41 bf 00 04 00 00") // mov r15d, 400h
        .bytes("89 44 24 20") // mov [rsp+20h], eax
        .bytes("8b d3") // mov edx, ebx
        .bytes("c7 44 24 60 01 00 00 00") // mov dword ptr [rsp+60h], 1
        .bytes("33 f6") // xor esi, esi
        .bytes("45 8b f7") // mov r14d, r15d
        .bytes("33 ed") // xor ebp, ebp
        .call(btree_search_key);
    asm.patch_jcc(fail);
    asm.bytes("48 81 c4 48 01 00 00") // add rsp, 148h
        .bytes("5f") // pop rdi
        .bytes("5b") // pop rbx
        .bytes("c3"); // ret

    asm.code
}

/// The same function for 32-bit builds, where the store manager comes in ECX.
pub fn sm_fe_check_present_x86(ip: u64, btree_search_key: u64) -> Vec<u8> {
    let mut asm = Asm::new(ip);

    asm.bytes("55") // push ebp
        .bytes("8b ec") // mov ebp, esp
        .bytes("83 ec 20") // sub esp, 20h
        .bytes("57") // push edi
        .bytes("8b f9") // mov edi, ecx
        .bytes("8d 45 e0") // lea eax, [ebp-20h]
        .bytes("50") // push eax
        .bytes("8d 8f a8 00 00 00") // lea ecx, [edi+0A8h]
        .call(btree_search_key)
        .bytes("5f") // pop edi
        .bytes("8b e5") // mov esp, ebp
        .bytes("5d") // pop ebp
        .bytes("c3"); // ret

    asm.code
}

fn put(buf: &mut [u8], off: usize, bytes: &[u8]) {
    buf[off..(off + bytes.len())].copy_from_slice(bytes);
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    put(buf, off, &v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    put(buf, off, &v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    put(buf, off, &v.to_le_bytes());
}

pub const PE_IMAGE_BASE: u64 = 0x1_4000_0000;
pub const PE_MACHINE_OFFSET: usize = 0x44;
pub const PE_TEXT_RVA: u32 = 0x1000;

const PE_HEADERS: usize = 0x400;
const PE_TEXT_SIZE: usize = 0x1000;
const PE_PDATA_RVA: u32 = 0x1600;
const PE_EDATA_RVA: u32 = 0x1800;

/// Builds a PE32+ file with a single section at `PE_TEXT_RVA`.
///
/// `code` is placed by RVA, `exports` name RVAs, `functions` become the
/// exception directory. Code must stay below `PE_PDATA_RVA`.
pub fn build_pe64(code: &[(u32, Vec<u8>)], exports: &[(&str, u32)], functions: &[(u32, u32)]) -> Vec<u8> {
    let mut file = vec![0u8; PE_HEADERS + PE_TEXT_SIZE];
    let at = |rva: u32| PE_HEADERS + (rva - PE_TEXT_RVA) as usize;

    // DOS header
    put(&mut file, 0, b"MZ");
    put_u32(&mut file, 0x3c, 0x40);
    put(&mut file, 0x40, b"PE\0\0");

    // COFF header
    let coff = PE_MACHINE_OFFSET;
    put_u16(&mut file, coff, 0x8664);
    put_u16(&mut file, coff + 2, 1);
    put_u16(&mut file, coff + 16, 0xf0);
    put_u16(&mut file, coff + 18, 0x22);

    // Optional header
    let opt = 0x58;
    put_u16(&mut file, opt, 0x20b);
    put_u32(&mut file, opt + 4, PE_TEXT_SIZE as u32);
    put_u32(&mut file, opt + 16, PE_TEXT_RVA);
    put_u32(&mut file, opt + 20, PE_TEXT_RVA);
    put_u64(&mut file, opt + 24, PE_IMAGE_BASE);
    put_u32(&mut file, opt + 32, 0x1000);
    put_u32(&mut file, opt + 36, 0x200);
    put_u16(&mut file, opt + 40, 10);
    put_u16(&mut file, opt + 48, 10);
    put_u32(&mut file, opt + 56, PE_TEXT_RVA + PE_TEXT_SIZE as u32);
    put_u32(&mut file, opt + 60, PE_HEADERS as u32);
    put_u16(&mut file, opt + 68, 1);
    put_u32(&mut file, opt + 108, 16);

    let dirs = opt + 112;

    // Section table
    let sec = opt + 240;
    put(&mut file, sec, b".text\0\0\0");
    put_u32(&mut file, sec + 8, PE_TEXT_SIZE as u32);
    put_u32(&mut file, sec + 12, PE_TEXT_RVA);
    put_u32(&mut file, sec + 16, PE_TEXT_SIZE as u32);
    put_u32(&mut file, sec + 20, PE_HEADERS as u32);
    put_u32(&mut file, sec + 36, 0x6000_0020);

    for (rva, bytes) in code {
        put(&mut file, at(*rva), bytes);
    }

    if !functions.is_empty() {
        for (i, (begin, end)) in functions.iter().enumerate() {
            let entry = at(PE_PDATA_RVA) + i * 12;
            put_u32(&mut file, entry, *begin);
            put_u32(&mut file, entry + 4, *end);
            put_u32(&mut file, entry + 8, PE_PDATA_RVA + 0x100);
        }
        put_u32(&mut file, dirs + 3 * 8, PE_PDATA_RVA);
        put_u32(&mut file, dirs + 3 * 8 + 4, (functions.len() * 12) as u32);
    }

    if !exports.is_empty() {
        let dir = PE_EDATA_RVA;
        let functions_rva = dir + 0x40;
        let names_rva = dir + 0x80;
        let ordinals_rva = dir + 0xc0;
        let dll_name_rva = dir + 0x100;
        let mut string_rva = dir + 0x120;

        put_u32(&mut file, at(dir) + 12, dll_name_rva);
        put_u32(&mut file, at(dir) + 16, 1);
        put_u32(&mut file, at(dir) + 20, exports.len() as u32);
        put_u32(&mut file, at(dir) + 24, exports.len() as u32);
        put_u32(&mut file, at(dir) + 28, functions_rva);
        put_u32(&mut file, at(dir) + 32, names_rva);
        put_u32(&mut file, at(dir) + 36, ordinals_rva);
        put(&mut file, at(dll_name_rva), b"ntoskrnl.exe\0");

        for (i, (name, rva)) in exports.iter().enumerate() {
            put_u32(&mut file, at(functions_rva) + i * 4, *rva);
            put_u32(&mut file, at(names_rva) + i * 4, string_rva);
            put_u16(&mut file, at(ordinals_rva) + i * 2, i as u16);
            put(&mut file, at(string_rva), name.as_bytes());
            string_rva += name.len() as u32 + 1;
        }

        put_u32(&mut file, dirs, dir);
        put_u32(&mut file, dirs + 4, string_rva - dir);
    }

    file
}
