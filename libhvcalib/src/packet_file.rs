use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use super::constants::{PACKET_FILE_MAGIC, PACKET_FILE_VERSION};
use super::error::PacketFileError;
use super::packet::{Packet, PacketKind};

fn eof_as_truncated(e: std::io::Error) -> PacketFileError {
    if e.kind() == ErrorKind::UnexpectedEof {
        PacketFileError::Truncated
    } else {
        PacketFileError::IOError(e)
    }
}

/// PacketFile reads the packet stream of a single part.
///
/// The stream is a small header (magic + format version) followed by records of
/// `type, crate, body length, body`. Records of an unknown type are skipped.
#[derive(Debug)]
pub struct PacketFile {
    reader: BufReader<File>,
    path: PathBuf,
    size_bytes: u64,
}

impl PacketFile {
    /// Open a packet file and validate its header
    pub fn new(path: &Path) -> Result<Self, PacketFileError> {
        if !path.exists() {
            return Err(PacketFileError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size_bytes = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(eof_as_truncated)?;
        if &magic != PACKET_FILE_MAGIC {
            return Err(PacketFileError::BadMagic);
        }
        let version = reader
            .read_u16::<LittleEndian>()
            .map_err(eof_as_truncated)?;
        if version != PACKET_FILE_VERSION {
            return Err(PacketFileError::BadVersion(version));
        }

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            size_bytes,
        })
    }

    /// Get the next packet in the file
    ///
    /// Returns a `Result<Option<Packet>>`. The Option is None once the file is exhausted.
    pub fn get_next_packet(&mut self) -> Result<Option<Packet>, PacketFileError> {
        loop {
            let mut type_byte = [0u8; 1];
            if self.reader.read(&mut type_byte)? == 0 {
                return Ok(None);
            }
            let mirror = self.reader.read_u8().map_err(eof_as_truncated)?;
            let body_len = self
                .reader
                .read_u32::<LittleEndian>()
                .map_err(eof_as_truncated)?;
            let mut body = vec![0u8; body_len as usize];
            self.reader
                .read_exact(&mut body)
                .map_err(eof_as_truncated)?;

            match PacketKind::try_from(type_byte[0]) {
                Ok(kind) => return Ok(Some(Packet::decode(kind, mirror, &body)?)),
                Err(unknown) => spdlog::warn!(
                    "Skipping packet of unrecognized type {} in {}",
                    unknown,
                    self.path.to_string_lossy()
                ),
            }
        }
    }

    /// Read every remaining packet
    pub fn read_all(&mut self) -> Result<Vec<Packet>, PacketFileError> {
        let mut packets = Vec::new();
        while let Some(packet) = self.get_next_packet()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    pub fn get_size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

/// PacketFileWriter produces the packet stream read by PacketFile
#[derive(Debug)]
pub struct PacketFileWriter {
    writer: BufWriter<File>,
}

impl PacketFileWriter {
    /// Create the file at path and write the stream header
    pub fn new(path: &Path) -> Result<Self, PacketFileError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(PACKET_FILE_MAGIC)?;
        writer.write_u16::<LittleEndian>(PACKET_FILE_VERSION)?;
        Ok(Self { writer })
    }

    pub fn write_packet(&mut self, packet: &Packet) -> Result<(), PacketFileError> {
        let body = packet.encode_body()?;
        self.writer.write_u8(packet.kind() as u8)?;
        self.writer.write_u8(packet.mirror())?;
        self.writer.write_u32::<LittleEndian>(body.len() as u32)?;
        self.writer.write_all(&body)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), PacketFileError> {
        self.writer.flush()?;
        Ok(())
    }
}
