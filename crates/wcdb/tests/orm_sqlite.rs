use wcdb::{
    Database, Error, HandleOperation, HandleOrmOperation, QueryOptions, Result, Row, TableBinding,
    Value,
};

#[derive(Debug, Clone, PartialEq)]
struct Message {
    id: i64,
    content: String,
    score: f64,
    attachment: Option<Vec<u8>>,
}

impl Message {
    fn new(content: &str, score: f64) -> Self {
        Self {
            id: 0,
            content: content.to_string(),
            score,
            attachment: None,
        }
    }
}

impl TableBinding for Message {
    fn columns() -> &'static [&'static str] {
        &["id", "content", "score", "attachment"]
    }

    fn values(&self) -> Vec<Value> {
        vec![
            Value::from(self.id),
            Value::from(self.content.as_str()),
            Value::from(self.score),
            self.attachment.clone().map(Value::from).unwrap_or(Value::Null),
        ]
    }

    fn extract(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_as(0)?,
            content: row.get_as(1)?,
            score: row.get_as(2)?,
            attachment: row.get_as(3)?,
        })
    }

    fn column_definitions() -> Vec<String> {
        vec![
            "id INTEGER PRIMARY KEY AUTOINCREMENT".into(),
            "content TEXT NOT NULL".into(),
            "score REAL".into(),
            "attachment BLOB".into(),
        ]
    }

    fn auto_increment_column() -> Option<&'static str> {
        Some("id")
    }

    fn is_auto_increment(&self) -> bool {
        self.id == 0
    }

    fn set_last_inserted_row_id(&mut self, row_id: i64) {
        self.id = row_id;
    }
}

#[test]
fn sqlite_orm_objects_roundtrip_with_auto_increment() {
    let dir = tempfile::tempdir().unwrap();
    let mut db = Database::new(dir.path().join("orm.db"));
    db.create_table::<Message>("messages").unwrap();

    let mut batch = vec![Message::new("hello", 1.5), Message::new("world", -2.0)];
    batch[1].attachment = Some(vec![0, 1, 2, 255]);
    db.insert_objects(&mut batch, "messages").unwrap();
    assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2]);

    let all: Vec<Message> = db.get_all_objects("messages", &QueryOptions::new().order_by("id")).unwrap();
    assert_eq!(all, batch);

    let mut explicit = Message::new("explicit", 0.0);
    explicit.id = 10;
    db.insert_objects(&mut [explicit.clone()], "messages").unwrap();
    let found: Option<Message> = db
        .get_first_object("messages", &QueryOptions::new().condition("id = 10"))
        .unwrap();
    assert_eq!(found, Some(explicit));
}

#[test]
fn sqlite_orm_update_and_delete_report_changes() {
    let mut db = Database::in_memory();
    db.create_table::<Message>("messages").unwrap();
    let mut batch: Vec<Message> = (0..5).map(|i| Message::new(&format!("m{}", i), i as f64)).collect();
    db.insert_objects(&mut batch, "messages").unwrap();

    let mut edited = batch[0].clone();
    edited.content = "edited".into();
    let changed = db
        .update_object(&edited, &["content"], "messages", &QueryOptions::new().condition("score < 2"))
        .unwrap();
    assert_eq!(changed, 2);

    let deleted = db
        .delete_objects("messages", &QueryOptions::new().condition_with("score >= ?", vec![Value::from(3)]))
        .unwrap();
    assert_eq!(deleted, 2);

    let contents = db.get_one_column("content", "messages", &QueryOptions::new().order_by("id")).unwrap();
    assert_eq!(
        contents,
        vec![Value::from("edited"), Value::from("edited"), Value::from("m2")]
    );
}

#[test]
fn sqlite_insert_or_replace_and_ignore() {
    let mut db = Database::in_memory();
    db.execute("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)").unwrap();
    db.insert_rows(&[vec![Value::from("a"), Value::from(1)]], &["k", "v"], "kv").unwrap();

    let duplicate = db.insert_rows(&[vec![Value::from("a"), Value::from(2)]], &["k", "v"], "kv");
    assert!(matches!(duplicate, Err(Error::Step(_))));

    db.insert_or_ignore_rows(&[vec![Value::from("a"), Value::from(3)]], &["k", "v"], "kv")
        .unwrap();
    assert_eq!(
        db.get_value("v", "kv", &QueryOptions::new()).unwrap(),
        Some(Value::Integer(1))
    );

    db.insert_or_replace_rows(&[vec![Value::from("a"), Value::from(4)]], &["k", "v"], "kv")
        .unwrap();
    assert_eq!(
        db.get_value("v", "kv", &QueryOptions::new()).unwrap(),
        Some(Value::Integer(4))
    );
}

#[test]
fn sqlite_values_keep_their_storage_class() {
    let mut db = Database::in_memory();
    db.execute("CREATE TABLE anything (v)").unwrap();
    let values = vec![
        Value::Null,
        Value::Integer(i64::MIN),
        Value::Integer(i64::MAX),
        Value::Float(0.25),
        Value::Text(String::new()),
        Value::Text("naïve ☃".into()),
        Value::Blob(Vec::new()),
        Value::Blob(vec![0, 0, 7]),
    ];
    let rows: Vec<Vec<Value>> = values.iter().cloned().map(|v| vec![v]).collect();
    db.insert_rows(&rows, &["v"], "anything").unwrap();

    let read = db
        .get_one_column("v", "anything", &QueryOptions::new().order_by("rowid"))
        .unwrap();
    assert_eq!(read, values);
}

#[test]
fn sqlite_rows_and_limits() {
    let mut db = Database::in_memory();
    db.execute("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();
    let rows: Vec<Vec<Value>> = (1..=4)
        .map(|i| vec![Value::from(i), Value::from(format!("b{}", i))])
        .collect();
    db.insert_rows(&rows, &["a", "b"], "t").unwrap();

    let page = db
        .get_all_rows(&["a", "b"], "t", &QueryOptions::new().order_by("a DESC").limit(2))
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].get(0), Some(&Value::Integer(4)));
    assert_eq!(page[1].get_as::<String>(1).unwrap(), "b3");

    let none = db
        .get_one_row(&["a"], "t", &QueryOptions::new().condition("a > 100"))
        .unwrap();
    assert!(none.is_none());

    let updated = db
        .update_row(
            &[Value::from("x")],
            &["b"],
            "t",
            &QueryOptions::new().condition_with("a <= ?", vec![Value::from(2)]),
        )
        .unwrap();
    assert_eq!(updated, 2);
    assert_eq!(
        db.get_value_from_statement("SELECT count(*) FROM t WHERE b = ?1", &[Value::from("x")])
            .unwrap(),
        Some(Value::Integer(2))
    );
}

#[test]
fn sqlite_table_view_binds_name() {
    let db = Database::in_memory();
    let mut messages = db.get_table::<Message>("inbox");
    messages.create().unwrap();
    messages
        .insert_objects(&mut [Message::new("one", 1.0), Message::new("two", 2.0)])
        .unwrap();
    assert_eq!(
        messages
            .update_value(Value::from(9.0), "score", &QueryOptions::new().condition("content = 'one'"))
            .unwrap(),
        1
    );
    let top = messages
        .get_first_object(&QueryOptions::new().order_by("score DESC"))
        .unwrap()
        .unwrap();
    assert_eq!(top.content, "one");
    assert_eq!(messages.delete_objects(&QueryOptions::new()).unwrap(), 2);
}
