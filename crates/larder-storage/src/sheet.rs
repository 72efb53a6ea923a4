//! Row-oriented archive store.
//!
//! Each collection is a "sheet": a JSON-lines file of rows in append order.
//! New rows are appended; updating or deleting a row rewrites the sheet.
//! Only exact-match filters are evaluated here, and listing always scans
//! the whole sheet, mirroring spreadsheet-style backends.

use crate::adapter::{collect_page, ListQuery, Page, StoreAdapter};
use crate::{Result, StorageError};
use async_trait::async_trait;
use larder_types::{Collection, FilterSupport, Record, RecordId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Sheet {
    rows: Vec<Record>,
    row_of: HashMap<RecordId, usize>,
}

impl Sheet {
    /// Parses a sheet file. Every newline-terminated line must be a row. A
    /// trailing line without its newline is the remains of an interrupted
    /// append: it is kept if it parses and dropped otherwise, and the second
    /// value reports that the file needs rewriting.
    fn parse(contents: &str) -> Result<(Self, bool)> {
        let (body, tail) = match contents.rfind('\n') {
            Some(end) => contents.split_at(end + 1),
            None => ("", contents),
        };

        let mut sheet = Sheet::default();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            sheet.upsert(serde_json::from_str(line)?);
        }

        let needs_repair = !tail.trim().is_empty();
        if needs_repair {
            match serde_json::from_str::<Record>(tail) {
                Ok(record) => sheet.upsert(record),
                Err(e) => tracing::warn!(error = %e, "Dropping torn row at end of sheet"),
            }
        }
        Ok((sheet, needs_repair))
    }

    fn upsert(&mut self, record: Record) {
        match self.row_of.get(&record.id) {
            Some(&row) => self.rows[row] = record,
            None => {
                self.row_of.insert(record.id.clone(), self.rows.len());
                self.rows.push(record);
            }
        }
    }

    fn render(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for row in &self.rows {
            serde_json::to_writer(&mut out, row)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    fn reindex(&mut self) {
        self.row_of = self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
    }
}

/// File-backed archive store with one sheet per collection.
#[derive(Debug)]
pub struct SheetStore {
    dir: PathBuf,
    sheets: Mutex<HashMap<Collection, Sheet>>,
}

impl SheetStore {
    /// Opens (creating if needed) a sheet directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            sheets: Mutex::new(HashMap::new()),
        })
    }

    fn sheet_path(&self, collection: Collection) -> PathBuf {
        self.dir.join(format!("{}.jsonl", collection.as_str()))
    }

    async fn load(&self, collection: Collection) -> Result<Sheet> {
        let contents = match tokio::fs::read_to_string(self.sheet_path(collection)).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Sheet::default()),
            Err(e) => return Err(e.into()),
        };

        let (sheet, needs_repair) = Sheet::parse(&contents)?;
        if needs_repair {
            tracing::warn!(%collection, rows = sheet.rows.len(), "Rewriting sheet after interrupted append");
            self.rewrite(collection, sheet.render()?).await?;
        }
        Ok(sheet)
    }

    /// Returns the cached sheet for `collection`, loading it on first use.
    async fn sheet_mut<'a>(
        &self,
        sheets: &'a mut HashMap<Collection, Sheet>,
        collection: Collection,
    ) -> Result<&'a mut Sheet> {
        if !sheets.contains_key(&collection) {
            let sheet = self.load(collection).await?;
            sheets.insert(collection, sheet);
        }
        Ok(sheets.entry(collection).or_default())
    }

    /// Runs `f` against the loaded sheet for `collection`.
    async fn with_sheet<T>(
        &self,
        collection: Collection,
        f: impl FnOnce(&mut Sheet) -> T,
    ) -> Result<T> {
        let mut sheets = self.sheets.lock().await;
        let sheet = self.sheet_mut(&mut sheets, collection).await?;
        Ok(f(sheet))
    }

    async fn rewrite(&self, collection: Collection, bytes: Vec<u8>) -> Result<()> {
        let path = self.sheet_path(collection);
        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Appends a new row. Falls back to an in-place update if the id exists.
    pub async fn append(&self, collection: Collection, record: &Record) -> Result<()> {
        let mut sheets = self.sheets.lock().await;
        let sheet = self.sheet_mut(&mut sheets, collection).await?;

        if let Some(&row) = sheet.row_of.get(&record.id) {
            let previous = std::mem::replace(&mut sheet.rows[row], record.clone());
            let bytes = sheet.render()?;
            if let Err(e) = self.rewrite(collection, bytes).await {
                sheet.rows[row] = previous;
                return Err(e);
            }
            return Ok(());
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.sheet_path(collection))
            .await?;
        let len_before = file.metadata().await?.len();
        let written = async {
            file.write_all(&line).await?;
            file.sync_data().await
        }
        .await;
        if let Err(e) = written {
            if let Err(truncate) = file.set_len(len_before).await {
                tracing::warn!(%collection, error = %truncate, "Failed to truncate partial row");
            }
            return Err(e.into());
        }

        sheet.row_of.insert(record.id.clone(), sheet.rows.len());
        sheet.rows.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for SheetStore {
    fn name(&self) -> &'static str {
        "sheet"
    }

    fn filter_support(&self) -> FilterSupport {
        FilterSupport::ExactMatch
    }

    async fn put(&self, collection: Collection, record: &Record) -> Result<()> {
        self.append(collection, record).await
    }

    async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>> {
        self.with_sheet(collection, |sheet| {
            sheet.row_of.get(id).map(|&row| sheet.rows[row].clone())
        })
        .await
    }

    async fn list(&self, collection: Collection, query: &ListQuery) -> Result<Page> {
        if query.filter.required_support() > FilterSupport::ExactMatch {
            return Err(StorageError::UnsupportedFilter { store: self.name() });
        }

        self.with_sheet(collection, |sheet| {
            let mut sorted: Vec<&Record> = sheet.rows.iter().collect();
            sorted.sort_by_key(|r| r.sort_key());
            collect_page(sorted.into_iter(), query)
        })
        .await
    }

    async fn delete(&self, collection: Collection, id: &RecordId) -> Result<bool> {
        let mut sheets = self.sheets.lock().await;
        let sheet = self.sheet_mut(&mut sheets, collection).await?;

        let Some(&row) = sheet.row_of.get(id) else {
            return Ok(false);
        };
        let removed = sheet.rows.remove(row);
        sheet.reindex();

        let bytes = sheet.render()?;
        if let Err(e) = self.rewrite(collection, bytes).await {
            sheet.rows.insert(row, removed);
            sheet.reindex();
            return Err(e);
        }
        Ok(true)
    }

    async fn count(&self, collection: Collection) -> Result<usize> {
        self.with_sheet(collection, |sheet| sheet.rows.len()).await
    }
}
