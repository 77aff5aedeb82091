use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use error_stack::{IntoReport, ResultExt};
use sluice_core::{encoding, ColumnType, Row};
use sluice_mon::BoundAccount;
use tempfile::NamedTempFile;

use crate::{Error, TempStorage};

/// An append-only file of encoded rows, read front to back.
///
/// Each entry is a 4-byte big-endian length followed by the row in the
/// preferred key encoding. When every written row has been read the file is
/// truncated and its disk bytes are released.
pub(crate) struct DiskRowStore {
    /// Keeps the file alive and deletes it on drop.
    _file: NamedTempFile,
    writer: BufWriter<File>,
    reader: BufReader<File>,
    types: Vec<ColumnType>,
    account: BoundAccount,
    written: usize,
    read: usize,
    unflushed: bool,
    scratch: Vec<u8>,
}

impl DiskRowStore {
    pub fn new(
        temp_storage: &TempStorage,
        types: Vec<ColumnType>,
        account: BoundAccount,
    ) -> error_stack::Result<Self, Error> {
        let file = temp_storage.create_file("rows-")?;
        let writer = file
            .as_file()
            .try_clone()
            .into_report()
            .change_context(Error::Io("open"))?;
        let reader = file.reopen().into_report().change_context(Error::Io("open"))?;
        Ok(Self {
            _file: file,
            writer: BufWriter::new(writer),
            reader: BufReader::new(reader),
            types,
            account,
            written: 0,
            read: 0,
            unflushed: false,
            scratch: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.written - self.read
    }

    pub fn disk_bytes(&self) -> u64 {
        self.account.used()
    }

    pub fn add(&mut self, row: &Row) -> error_stack::Result<(), Error> {
        self.scratch.clear();
        encoding::encode_row(&mut self.scratch, row);
        let len = self.scratch.len() as u32;

        self.account
            .grow(4 + len as u64)
            .change_context(Error::DiskBudget)?;
        self.writer
            .write_all(&len.to_be_bytes())
            .and_then(|_| self.writer.write_all(&self.scratch))
            .into_report()
            .change_context(Error::Io("write"))?;
        self.written += 1;
        self.unflushed = true;
        Ok(())
    }

    pub fn next_row(&mut self) -> error_stack::Result<Option<Row>, Error> {
        if self.read == self.written {
            return Ok(None);
        }
        if self.unflushed {
            self.writer
                .flush()
                .into_report()
                .change_context(Error::Io("flush"))?;
            self.unflushed = false;
        }

        let mut len = [0u8; 4];
        self.reader
            .read_exact(&mut len)
            .into_report()
            .change_context(Error::Io("read"))?;
        self.scratch.resize(u32::from_be_bytes(len) as usize, 0);
        self.reader
            .read_exact(&mut self.scratch)
            .into_report()
            .change_context(Error::Io("read"))?;
        let row = encoding::decode_row(&mut self.scratch.as_slice(), &self.types)
            .change_context(Error::Decode)?;

        self.read += 1;
        if self.read == self.written {
            self.reset()?;
        }
        Ok(Some(row))
    }

    /// Truncates the file once everything written has been read.
    fn reset(&mut self) -> error_stack::Result<(), Error> {
        self.writer
            .get_ref()
            .set_len(0)
            .into_report()
            .change_context(Error::Io("truncate"))?;
        self.writer
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.reader.seek(SeekFrom::Start(0)))
            .into_report()
            .change_context(Error::Io("seek"))?;
        self.read = 0;
        self.written = 0;
        self.account.clear();
        Ok(())
    }

    pub fn close(&mut self) {
        self.account.close();
    }
}
