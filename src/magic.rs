//! Magic-byte table used to infer an extension for archive entries whose
//! names are unknown. Patterns are matched in order at their declared offset
//! against the leading bytes of the decompressed entry.

struct Magic {
    pattern: &'static [u8],
    extension: &'static str,
    offset: usize,
}

const fn at(pattern: &'static [u8], extension: &'static str, offset: usize) -> Magic {
    Magic {
        pattern,
        extension,
        offset,
    }
}

const fn m(pattern: &'static [u8], extension: &'static str) -> Magic {
    at(pattern, extension, 0)
}

static MAGIC_TABLE: &[Magic] = &[
    m(b"OggS", ".ogg"),
    m(b"\x00\x01\x00\x00\x00", ".ttf"),
    m(b"true", ".ttf"),
    m(b"OTTO", ".otf"),
    m(b"\x1a\x45\xdf\xa3", ".webm"),
    m(b"DDS ", ".dds"),
    m(b"TEX\0", ".tex"),
    m(b"\x89PNG", ".png"),
    m(b"\xff\xd8\xff", ".jpg"),
    m(b"<svg", ".svg"),
    m(b"%PDF", ".pdf"),
    m(b"PROP", ".bin"),
    m(b"PTCH", ".bin"),
    m(b"BKHD", ".bnk"),
    m(b"WPK\0", ".wpk"),
    m(b"r3d2Mesh", ".scb"),
    m(b"r3d2anmd", ".anm"),
    m(b"r3d2canm", ".anm"),
    m(b"r3d2sklt", ".skl"),
    m(b"\x33\x22\x11\x00", ".skn"),
    m(b"PreLoadBuildingBlocks = {", ".preload"),
    m(b"\x1bLuaQ\x00\x01\x04\x04", ".luabin"),
    m(b"\x1bLuaQ\x00\x01\x04\x08", ".luabin64"),
    m(b"OPAM", ".mob"),
    m(b"[ObjectBegin]", ".sco"),
    m(b"[MaterialBegin]", ".mat"),
    m(b"WGEO", ".wgeo"),
    m(b"MGEO", ".mapgeo"),
    m(b"OEGM", ".mapgeo"),
    m(b"NVR\0", ".nvr"),
    m(b"RST", ".stringtable"),
    at(b"ftyp", ".mp4", 4),
    at(b"WEBP", ".webp", 8),
];

/// Returns the extension of the first pattern matching `data`, if any.
pub fn sniff(data: &[u8]) -> Option<&'static str> {
    MAGIC_TABLE.iter().find_map(|magic| {
        let window = data.get(magic.offset..magic.offset + magic.pattern.len())?;
        (window == magic.pattern).then_some(magic.extension)
    })
}
