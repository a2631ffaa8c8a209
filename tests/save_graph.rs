use std::sync::Arc;

use graphstitch::{
  Entity, EntityGraphMapper, MappedRelationship, RefDef, Result, Session, SnapshotStore,
  Statement, StatementResult, StatementSink, StitchError, TypeDef, TypeRegistry, UNBOUNDED,
};

/// Pretends to be a graph store: assigns sequential identities to every row
/// token it sees and reports every guarded row as matched.
struct StubSink {
  statements: Vec<Statement>,
  next_id: i64,
}

impl StubSink {
  fn new() -> Self {
    Self {
      statements: Vec::new(),
      next_id: 1000,
    }
  }

  fn starting_at(next_id: i64) -> Self {
    Self {
      statements: Vec::new(),
      next_id,
    }
  }

  fn texts(&self) -> Vec<&str> {
    self.statements.iter().map(|s| s.text.as_str()).collect()
  }
}

impl StatementSink for StubSink {
  fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
    self.statements.push(statement.clone());
    let mut generated_ids = Vec::new();
    if let Some(serde_json::Value::Array(rows)) = statement.parameters.get("rows") {
      for row in rows {
        for key in ["nodeRef", "relRef"] {
          if let Some(serde_json::Value::String(token)) = row.get(key) {
            generated_ids.push((token.clone(), self.next_id));
            self.next_id += 1;
          }
        }
      }
    }
    Ok(StatementResult {
      generated_ids,
      rows_affected: statement.row_count(),
    })
  }
}

fn school_registry() -> Arc<TypeRegistry> {
  let _ = env_logger::builder().is_test(true).try_init();
  let mut registry = TypeRegistry::new();
  registry
    .register(
      TypeDef::node("Teacher")
        .prop("name")
        .reference(RefDef::new("school", "SCHOOL", "School"))
        .reference(RefDef::new("courses", "COURSES", "Course")),
    )
    .expect("register Teacher");
  registry
    .register(TypeDef::node("School").prop("name"))
    .expect("register School");
  registry
    .register(
      TypeDef::node("Course")
        .prop("title")
        .reference(RefDef::new("students", "STUDENTS", "Student")),
    )
    .expect("register Course");
  registry
    .register(TypeDef::node("Student").prop("name"))
    .expect("register Student");
  Arc::new(registry)
}

#[test]
fn save_compiles_one_statement_per_shape() {
  let mut session = Session::new(school_registry());

  let mary = Entity::new("Teacher");
  mary.set_prop("name", "Mary");
  let school = Entity::new("School");
  school.set_prop("name", "Hills Road");
  let maths = Entity::new("Course");
  maths.set_prop("title", "Maths");
  let physics = Entity::new("Course");
  physics.set_prop("title", "Physics");
  mary.set_ref("school", &school);
  mary.push_ref("courses", &maths);
  mary.push_ref("courses", &physics);

  let mut sink = StubSink::new();
  session.save(&mut sink, &mary).expect("save graph");

  // three node shapes (Teacher, School, Course) and two relationship shapes
  assert_eq!(sink.statements.len(), 5);

  let course_create = sink
    .statements
    .iter()
    .find(|s| s.text.contains("(n:`Course`)"))
    .expect("course create statement");
  assert_eq!(course_create.row_count(), 2);

  let course_rels = sink
    .statements
    .iter()
    .find(|s| s.text.contains("[rel:`COURSES`]"))
    .expect("courses relationship statement");
  assert_eq!(course_rels.row_count(), 2);

  assert!(mary.id().is_some());
  assert!(maths.id().is_some());
  assert_ne!(maths.id(), physics.id());
}

#[test]
fn many_entities_one_shape_stay_one_statement() {
  let mut session = Session::new(school_registry());

  let course = Entity::new("Course");
  course.set_prop("title", "Intro");
  for i in 0..100 {
    let student = Entity::new("Student");
    student.set_prop("name", format!("student-{i}"));
    course.push_ref("students", &student);
  }

  let mut sink = StubSink::new();
  session.save(&mut sink, &course).expect("save course");

  assert_eq!(sink.statements.len(), 3);
  let student_create = sink
    .statements
    .iter()
    .find(|s| s.text.contains("(n:`Student`)"))
    .expect("student create statement");
  assert_eq!(student_create.row_count(), 100);
  let enrolments = sink
    .statements
    .iter()
    .find(|s| s.text.contains("[rel:`STUDENTS`]"))
    .expect("enrolment statement");
  assert_eq!(enrolments.row_count(), 100);
}

#[test]
fn depth_limits_bound_the_traversal() {
  let registry = school_registry();

  // depth 0: the root node alone, no relationships
  let mut session = Session::new(registry.clone());
  let mary = Entity::new("Teacher");
  mary.set_prop("name", "Mary");
  let course = Entity::new("Course");
  course.set_prop("title", "Maths");
  let student = Entity::new("Student");
  student.set_prop("name", "Alice");
  mary.push_ref("courses", &course);
  course.push_ref("students", &student);

  let mut sink = StubSink::new();
  session
    .save_with_depth(&mut sink, &mary, 0)
    .expect("save at depth 0");
  assert_eq!(sink.statements.len(), 1);
  assert!(sink.texts()[0].contains("(n:`Teacher`)"));
  assert!(course.id().is_none());

  // depth 1: one hop out, the student two hops away stays unsaved
  let mut session = Session::new(registry);
  let mut sink = StubSink::new();
  session
    .save_with_depth(&mut sink, &mary, 1)
    .expect("save at depth 1");
  assert!(sink.texts().iter().any(|t| t.contains("(n:`Course`)")));
  assert!(!sink.texts().iter().any(|t| t.contains("(n:`Student`)")));
  assert!(course.id().is_some());
  assert!(student.id().is_none());
}

#[test]
fn new_node_linking_to_existing_node_mixes_token_and_identity() {
  let registry = school_registry();
  let mut snapshot = SnapshotStore::new();

  let waller = Entity::with_id("School", 0);
  waller.set_prop("name", "Waller");
  snapshot.record_entity(0, &waller, registry.get("School").expect("School def"));

  let mary = Entity::new("Teacher");
  mary.set_prop("name", "Mary");
  mary.set_ref("school", &waller);

  let mapper = EntityGraphMapper::new(&registry, &snapshot);
  let compiler = mapper.map(&mary, UNBOUNDED).expect("map graph");

  let creates = compiler.create_nodes_statements();
  assert_eq!(creates.len(), 1);
  assert!(creates[0].text.contains("(n:`Teacher`)"));
  assert_eq!(creates[0].row_count(), 1);

  // before the store reports Mary's identity, the relationship row carries
  // her symbolic token next to the school's resolved identity
  let rels = compiler.create_relationships_statements();
  assert_eq!(rels.len(), 1);
  assert!(rels[0].text.contains("[rel:`SCHOOL`]"));
  let rows = rels[0].parameters.get("rows").expect("rows param");
  assert_eq!(rows[0]["startNodeId"], serde_json::json!("_0"));
  assert_eq!(rows[0]["endNodeId"], serde_json::json!(0));
}

#[test]
fn removing_some_of_a_collection_deletes_exactly_those_edges() {
  let mut session = Session::new(school_registry());

  let course = Entity::with_id("Course", 1);
  course.set_prop("title", "Maths");
  session.track(&course).expect("track course");
  let mut students = Vec::new();
  for id in 2..5 {
    let student = Entity::with_id("Student", id);
    student.set_prop("name", format!("student-{id}"));
    session.track(&student).expect("track student");
    session.track_relationship(MappedRelationship::new(
      1, "STUDENTS", id, None, "Course", "Student",
    ));
    course.push_ref("students", &student);
    students.push(student);
  }

  course.remove_ref("students", &students[0]);
  course.remove_ref("students", &students[1]);

  let mut sink = StubSink::new();
  session.save(&mut sink, &course).expect("save course");

  assert_eq!(sink.statements.len(), 1);
  assert!(sink.texts()[0].contains("[rel:`STUDENTS`]->(endNode) DELETE rel"));
  assert_eq!(sink.statements[0].row_count(), 2);
}

#[test]
fn moving_a_reference_replaces_the_edge() {
  let mut session = Session::new(school_registry());

  let mary = Entity::with_id("Teacher", 1);
  mary.set_prop("name", "Mary");
  let old_school = Entity::with_id("School", 2);
  old_school.set_prop("name", "Hills Road");
  mary.set_ref("school", &old_school);
  session.track(&mary).expect("track teacher");
  session.track(&old_school).expect("track school");
  session.track_relationship(MappedRelationship::new(
    1, "SCHOOL", 2, None, "Teacher", "School",
  ));

  let new_school = Entity::new("School");
  new_school.set_prop("name", "Coleridge");
  mary.set_ref("school", &new_school);

  let mut sink = StubSink::new();
  session.save(&mut sink, &mary).expect("save moved reference");

  assert!(sink.texts().iter().any(|t| t.contains("CREATE (n:`School`)")));
  assert!(sink.texts().iter().any(|t| t.contains("DELETE rel")));

  let new_id = new_school.id().expect("new school id");
  assert!(session
    .snapshot()
    .contains_relationship(&MappedRelationship::new(
      1,
      "SCHOOL",
      new_id,
      None,
      "Teacher",
      "School"
    )));
  assert!(!session
    .snapshot()
    .contains_relationship(&MappedRelationship::new(
      1, "SCHOOL", 2, None, "Teacher", "School"
    )));

  let mut second = StubSink::new();
  session.save(&mut second, &mary).expect("settled save");
  assert!(second.statements.is_empty());
}

#[test]
fn relationship_entity_round_trip() {
  let mut registry = TypeRegistry::new();
  registry
    .register(
      TypeDef::node("Person")
        .prop("name")
        .reference(RefDef::new("jobs", "EMPLOYED_BY", "Employment").relationship_entity()),
    )
    .expect("register Person");
  registry
    .register(TypeDef::node("Company").prop("name"))
    .expect("register Company");
  registry
    .register(
      TypeDef::relationship("Employment", "EMPLOYED_BY", "employee", "employer").prop("role"),
    )
    .expect("register Employment");
  let mut session = Session::new(Arc::new(registry));

  let alice = Entity::new("Person");
  alice.set_prop("name", "Alice");
  let acme = Entity::new("Company");
  acme.set_prop("name", "Acme");
  let job = Entity::new("Employment");
  job.set_prop("role", "engineer");
  job.set_ref("employee", &alice);
  job.set_ref("employer", &acme);
  alice.push_ref("jobs", &job);

  let mut sink = StubSink::new();
  session.save(&mut sink, &alice).expect("save employment");

  let edge_create = sink
    .statements
    .iter()
    .find(|s| s.text.contains("CREATE (startNode)-[rel:`EMPLOYED_BY`]->(endNode)"))
    .expect("relationship entity create");
  assert!(edge_create.text.contains("SET rel += row.props"));
  let job_id = job.id().expect("edge identity assigned");

  // changing only the edge's own property compiles a single update
  job.set_prop("role", "manager");
  let mut second = StubSink::new();
  session.save(&mut second, &alice).expect("save edge change");
  assert_eq!(second.statements.len(), 1);
  assert!(second.texts()[0].contains("ID(rel) = row.relId"));

  let mut third = StubSink::new();
  session.save(&mut third, &alice).expect("settled save");
  assert!(third.statements.is_empty());
  assert_eq!(job.id(), Some(job_id));
}

#[test]
fn repointed_relationship_entity_is_recreated() {
  let mut registry = TypeRegistry::new();
  registry
    .register(
      TypeDef::node("Person")
        .prop("name")
        .reference(RefDef::new("jobs", "EMPLOYED_BY", "Employment").relationship_entity()),
    )
    .expect("register Person");
  registry
    .register(TypeDef::node("Company").prop("name"))
    .expect("register Company");
  registry
    .register(
      TypeDef::relationship("Employment", "EMPLOYED_BY", "employee", "employer").prop("role"),
    )
    .expect("register Employment");
  let mut session = Session::new(Arc::new(registry));

  let alice = Entity::new("Person");
  let acme = Entity::new("Company");
  let job = Entity::new("Employment");
  job.set_prop("role", "engineer");
  job.set_ref("employee", &alice);
  job.set_ref("employer", &acme);
  alice.push_ref("jobs", &job);

  let mut sink = StubSink::new();
  session.save(&mut sink, &alice).expect("initial save");
  let first_edge = job.id().expect("first edge id");

  // re-point the edge at a different employer: old edge goes, new one comes
  let globex = Entity::new("Company");
  globex.set_prop("name", "Globex");
  job.set_ref("employer", &globex);

  let mut second = StubSink::starting_at(2000);
  session.save(&mut second, &alice).expect("save repointed edge");
  assert!(second
    .texts()
    .iter()
    .any(|t| t.contains("CREATE (startNode)-[rel:`EMPLOYED_BY`]->(endNode)")));
  assert!(second
    .texts()
    .iter()
    .any(|t| t.contains("ID(rel) = row.relId DELETE rel")));
  assert_ne!(job.id(), Some(first_edge));
}

#[test]
fn primary_index_types_merge_instead_of_create() {
  let mut registry = TypeRegistry::new();
  registry
    .register(TypeDef::node("Book").prop("isbn").prop("title").primary_index("isbn"))
    .expect("register Book");
  let mut session = Session::new(Arc::new(registry));

  let book = Entity::new("Book");
  book.set_prop("isbn", "978-3");
  book.set_prop("title", "SICP");

  let mut sink = StubSink::new();
  session.save(&mut sink, &book).expect("save book");
  assert_eq!(sink.statements.len(), 1);
  assert!(sink.texts()[0].contains("MERGE (n:`Book`{`isbn`: row.props.`isbn`})"));
}

#[test]
fn version_guard_failure_surfaces_as_stale_state() {
  struct StaleSink;
  impl StatementSink for StaleSink {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
      let rows_affected = if statement.guarded { 0 } else { statement.row_count() };
      Ok(StatementResult {
        generated_ids: Vec::new(),
        rows_affected,
      })
    }
  }

  let mut registry = TypeRegistry::new();
  registry
    .register(TypeDef::node("Doc").prop("title").versioned("rev"))
    .expect("register Doc");
  let mut session = Session::new(Arc::new(registry));

  let doc = Entity::with_id("Doc", 7);
  doc.set_prop("title", "draft");
  doc.set_prop("rev", 5);
  session.track(&doc).expect("track doc");

  doc.set_prop("title", "final");
  let err = session.save(&mut StaleSink, &doc).expect_err("stale save");
  assert!(matches!(
    err,
    StitchError::StaleState {
      expected: 1,
      affected: 0
    }
  ));
  // the counter was not touched, so the caller can reload and retry
  assert_eq!(doc.prop("rev"), Some(serde_json::json!(5)));
}

#[test]
fn deleting_a_versioned_relationship_entity_is_guarded() {
  struct StaleSink;
  impl StatementSink for StaleSink {
    fn execute(&mut self, statement: &Statement) -> Result<StatementResult> {
      let rows_affected = if statement.guarded { 0 } else { statement.row_count() };
      Ok(StatementResult {
        generated_ids: Vec::new(),
        rows_affected,
      })
    }
  }

  let mut registry = TypeRegistry::new();
  registry
    .register(
      TypeDef::node("Person")
        .prop("name")
        .reference(RefDef::new("jobs", "EMPLOYED_BY", "Employment").relationship_entity()),
    )
    .expect("register Person");
  registry
    .register(TypeDef::node("Company").prop("name"))
    .expect("register Company");
  registry
    .register(
      TypeDef::relationship("Employment", "EMPLOYED_BY", "employee", "employer")
        .prop("role")
        .versioned("rev"),
    )
    .expect("register Employment");
  let mut session = Session::new(Arc::new(registry));

  let alice = Entity::new("Person");
  alice.set_prop("name", "Alice");
  let acme = Entity::new("Company");
  acme.set_prop("name", "Acme");
  let job = Entity::new("Employment");
  job.set_prop("role", "engineer");
  job.set_ref("employee", &alice);
  job.set_ref("employer", &acme);
  alice.push_ref("jobs", &job);

  let mut sink = StubSink::new();
  session.save(&mut sink, &alice).expect("initial save");

  // dropping the edge compiles a delete guarded on its last-known counter;
  // a concurrent writer bumping it makes the whole pass fail
  alice.clear_ref("jobs");
  let err = session.save(&mut StaleSink, &alice).expect_err("stale delete");
  assert!(matches!(
    err,
    StitchError::StaleState {
      expected: 1,
      affected: 0
    }
  ));

  // nothing was merged, so a retry against a willing store still deletes
  let mut retry = StubSink::new();
  session.save(&mut retry, &alice).expect("retried delete");
  assert_eq!(retry.statements.len(), 1);
  assert!(retry.texts()[0].contains("AND rel.`rev` = row.version DELETE rel"));
  assert!(retry.statements[0].guarded);

  let mut settled = StubSink::new();
  session.save(&mut settled, &alice).expect("settled save");
  assert!(settled.statements.is_empty());
}

#[test]
fn saving_the_other_endpoint_does_not_infer_deletion() {
  let mut session = Session::new(school_registry());

  let course = Entity::with_id("Course", 1);
  course.set_prop("title", "Maths");
  let student = Entity::with_id("Student", 2);
  student.set_prop("name", "Alice");
  session.track(&course).expect("track course");
  session.track(&student).expect("track student");
  session.track_relationship(MappedRelationship::new(
    1, "STUDENTS", 2, None, "Course", "Student",
  ));

  // the student dropped out of the course's collection, but the student does
  // not own the STUDENTS field: saving the student alone proves nothing about
  // the edge and must not delete it
  let mut sink = StubSink::new();
  session.save(&mut sink, &student).expect("save student");
  assert!(sink.statements.is_empty());
  assert!(session.snapshot().contains_relationship(&MappedRelationship::new(
    1, "STUDENTS", 2, None, "Course", "Student",
  )));

  // saving the owning side does clear the field and deletes the edge
  let mut second = StubSink::new();
  session.save(&mut second, &course).expect("save course");
  assert_eq!(second.statements.len(), 1);
  assert!(second.texts()[0].contains("[rel:`STUDENTS`]->(endNode) DELETE rel"));
  assert!(!session.snapshot().contains_relationship(&MappedRelationship::new(
    1, "STUDENTS", 2, None, "Course", "Student",
  )));
}
